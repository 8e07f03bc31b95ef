//! Code unit loading
//!
//! A code unit exposes one C entry point,
//!
//! ```c
//! int run(int objc, void *objv[], int argc, char *argv[]);
//! ```
//!
//! where `objv` holds the capability objects of the host process that started
//! the zygote and `argv` is the caller's argument vector with the unit's
//! locator as `argv[0]`. Loaders resolve a locator to a [`CodeUnit`]:
//!
//! - [`DlopenLoader`]: shared objects on disk, with a [`Freshness`] policy
//! - [`ImageLoader`]: the `run` symbol already linked into this process
//! - [`StaticLoader`]: Rust functions registered by name

use crate::error::LoadError;
use libloading::os::unix::{Library, Symbol, RTLD_LAZY};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CString, OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::ptr::{self, NonNull};
use std::str::FromStr;

/// Name of the entry symbol every loadable unit exports
pub const ENTRY_SYMBOL: &[u8] = b"run\0";

/// C signature of the entry symbol
pub type RawEntry = unsafe extern "C" fn(
    objc: c_int,
    objv: *mut *mut c_void,
    argc: c_int,
    argv: *mut *mut c_char,
) -> c_int;

/// An opaque, host-local object handed to every code unit
///
/// Capabilities come from the process that started the zygote and are never
/// read from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability(NonNull<c_void>);

impl Capability {
    /// Wrap a raw pointer; `None` for null
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Wrap a reference that lives for the rest of the program
    pub fn from_static<T>(value: &'static T) -> Self {
        Self(NonNull::from(value).cast())
    }

    /// The pointer as the entry point receives it
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Reinterpret the capability as a `T`
    ///
    /// # Safety
    ///
    /// The capability must have been created from a `&'static T`, or from a
    /// pointer to a live `T`.
    pub unsafe fn downcast_ref<'a, T>(self) -> &'a T {
        &*self.0.as_ptr().cast::<T>()
    }
}

/// Ordered list of capability objects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    handles: Vec<Capability>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a capability
    pub fn with(mut self, capability: Capability) -> Self {
        self.handles.push(capability);
        self
    }

    pub fn push(&mut self, capability: Capability) {
        self.handles.push(capability);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Capability> {
        self.handles.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.handles.iter().copied()
    }

    /// Null-terminated pointer array for the C entry point
    fn to_raw(&self) -> Vec<*mut c_void> {
        self.iter()
            .map(Capability::as_ptr)
            .chain(std::iter::once(ptr::null_mut()))
            .collect()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            handles: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for capability in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{:p}", capability.as_ptr())?;
            first = false;
        }
        Ok(())
    }
}

/// A resolved, callable code unit
pub trait CodeUnit {
    /// Run the unit's entry point; `argv[0]` is the unit's locator
    fn invoke(&mut self, capabilities: &Capabilities, argv: &[OsString]) -> Result<i32, LoadError>;
}

/// Resolves locators to code units
pub trait UnitLoader {
    fn load(&self, locator: &OsStr) -> Result<Box<dyn CodeUnit>, LoadError>;
}

/// How hard `dlopen` should try to see the newest definitions of symbols
///
/// A zygote lives for a long time while the units it loads get rebuilt.
/// Without deep binding, a rebuilt unit may resolve its own symbols against
/// definitions an earlier unit (or the zygote itself) already pulled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// `RTLD_LAZY | RTLD_DEEPBIND`: the unit's own symbols win. glibc only;
    /// other platforms fall back to `Portable` with a warning.
    #[default]
    Deepbind,
    /// Plain `RTLD_LAZY`
    Portable,
}

impl Freshness {
    /// Flags passed to `dlopen`
    pub fn dlopen_flags(self) -> c_int {
        match self {
            Freshness::Deepbind => deepbind_flags().unwrap_or(RTLD_LAZY),
            Freshness::Portable => RTLD_LAZY,
        }
    }

    /// Whether this platform honours the requested policy
    pub fn is_supported(self) -> bool {
        match self {
            Freshness::Deepbind => deepbind_flags().is_some(),
            Freshness::Portable => true,
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn deepbind_flags() -> Option<c_int> {
    Some(RTLD_LAZY | libc::RTLD_DEEPBIND)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn deepbind_flags() -> Option<c_int> {
    None
}

impl FromStr for Freshness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deepbind" | "fresh" => Ok(Freshness::Deepbind),
            "portable" | "lazy" => Ok(Freshness::Portable),
            other => Err(format!("unknown loader policy '{}'", other)),
        }
    }
}

/// Loads shared objects with `dlopen`
#[derive(Debug, Clone, Copy, Default)]
pub struct DlopenLoader {
    freshness: Freshness,
}

impl DlopenLoader {
    pub fn new(freshness: Freshness) -> Self {
        if !freshness.is_supported() {
            tracing::warn!(
                ?freshness,
                "dlopen cannot deep-bind here; rebuilt units may see stale symbols"
            );
        }
        Self { freshness }
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }
}

impl UnitLoader for DlopenLoader {
    fn load(&self, locator: &OsStr) -> Result<Box<dyn CodeUnit>, LoadError> {
        // SAFETY: loading a unit runs its initialisers; units are trusted code
        let library = unsafe { Library::open(Some(locator), self.freshness.dlopen_flags()) }
            .map_err(|source| LoadError::Open {
                locator: locator.to_os_string(),
                source,
            })?;

        DynamicUnit::resolve(library, locator).map(|unit| Box::new(unit) as Box<dyn CodeUnit>)
    }
}

/// Resolves `run` in the running program's own image
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageLoader;

impl UnitLoader for ImageLoader {
    fn load(&self, locator: &OsStr) -> Result<Box<dyn CodeUnit>, LoadError> {
        DynamicUnit::resolve(Library::this(), locator).map(|unit| Box::new(unit) as Box<dyn CodeUnit>)
    }
}

/// A unit backed by a `dlopen` handle; unloaded on drop
struct DynamicUnit {
    entry: RawEntry,
    // Keeps `entry` mapped
    _library: Library,
}

impl DynamicUnit {
    fn resolve(library: Library, locator: &OsStr) -> Result<Self, LoadError> {
        // SAFETY: units promise `run` has the RawEntry signature
        let entry = unsafe {
            let symbol: Symbol<RawEntry> =
                library
                    .get(ENTRY_SYMBOL)
                    .map_err(|source| LoadError::MissingEntry {
                        locator: locator.to_os_string(),
                        source,
                    })?;
            *symbol
        };

        Ok(Self {
            entry,
            _library: library,
        })
    }
}

impl CodeUnit for DynamicUnit {
    fn invoke(&mut self, capabilities: &Capabilities, argv: &[OsString]) -> Result<i32, LoadError> {
        let args = argv
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes()).map_err(|_| LoadError::InvalidArgument(arg.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut arg_ptrs: Vec<*mut c_char> = args
            .iter()
            .map(|arg| arg.as_ptr() as *mut c_char)
            .chain(std::iter::once(ptr::null_mut()))
            .collect();
        let mut objv = capabilities.to_raw();

        let argc = c_int::try_from(args.len()).map_err(|_| LoadError::TooMany("arguments"))?;
        let objc =
            c_int::try_from(capabilities.len()).map_err(|_| LoadError::TooMany("capabilities"))?;

        // SAFETY: both arrays are null-terminated and outlive the call; `args`
        // keeps the argument strings alive
        let status = unsafe { (self.entry)(objc, objv.as_mut_ptr(), argc, arg_ptrs.as_mut_ptr()) };
        Ok(status)
    }
}

/// Signature of a unit registered with a [`StaticLoader`]
pub type UnitFn = fn(&Capabilities, &[OsString]) -> i32;

/// Resolves locators against a table of Rust functions
#[derive(Debug, Clone, Default)]
pub struct StaticLoader {
    units: HashMap<OsString, UnitFn>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `unit` under `locator`
    pub fn register(mut self, locator: impl Into<OsString>, unit: UnitFn) -> Self {
        self.units.insert(locator.into(), unit);
        self
    }
}

struct FnUnit(UnitFn);

impl CodeUnit for FnUnit {
    fn invoke(&mut self, capabilities: &Capabilities, argv: &[OsString]) -> Result<i32, LoadError> {
        Ok((self.0)(capabilities, argv))
    }
}

impl UnitLoader for StaticLoader {
    fn load(&self, locator: &OsStr) -> Result<Box<dyn CodeUnit>, LoadError> {
        self.units
            .get(locator)
            .map(|unit| Box::new(FnUnit(*unit)) as Box<dyn CodeUnit>)
            .ok_or_else(|| LoadError::NotRegistered(locator.to_os_string()))
    }
}

/// Run a unit in this process, without forking or a channel
///
/// This is the "no zygote" fallback: same entry contract, none of the
/// protocol, descriptor transfer or process lifecycle.
pub fn run_direct<L: UnitLoader + ?Sized>(
    loader: &L,
    locator: &OsStr,
    capabilities: &Capabilities,
    args: &[OsString],
) -> Result<i32, LoadError> {
    let mut unit = loader.load(locator)?;
    let argv: Vec<OsString> = std::iter::once(locator.to_os_string())
        .chain(args.iter().cloned())
        .collect();

    tracing::info!(?locator, %capabilities, ?args, "running code unit in-process");
    unit.invoke(capabilities, &argv)
}

/// Run the `run` symbol linked into this program with an empty argv[0]
pub fn run_linked(capabilities: &Capabilities) -> Result<i32, LoadError> {
    run_direct(&ImageLoader, OsStr::new(""), capabilities, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    static ANSWER: u32 = 42;

    fn count_args(_: &Capabilities, argv: &[OsString]) -> i32 {
        argv.len() as i32
    }

    fn read_answer(capabilities: &Capabilities, _: &[OsString]) -> i32 {
        match capabilities.get(0) {
            // SAFETY: the test registers a &'static u32
            Some(cap) => unsafe { *cap.downcast_ref::<u32>() as i32 },
            None => -1,
        }
    }

    #[test]
    fn test_static_loader_runs_registered_unit() {
        let loader = StaticLoader::new().register("count", count_args);

        let status = run_direct(
            &loader,
            OsStr::new("count"),
            &Capabilities::new(),
            &[OsString::from("a"), OsString::from("b")],
        )
        .unwrap();

        // argv[0] is the locator
        assert_eq!(status, 3);
    }

    #[test]
    fn test_static_loader_unknown_locator() {
        let loader = StaticLoader::new();
        let err = loader.load(OsStr::new("missing")).err().unwrap();
        assert!(matches!(err, LoadError::NotRegistered(_)));
    }

    #[test]
    fn test_capabilities_reach_the_unit() {
        let loader = StaticLoader::new().register("answer", read_answer);
        let capabilities = Capabilities::new().with(Capability::from_static(&ANSWER));

        let status = run_direct(&loader, OsStr::new("answer"), &capabilities, &[]).unwrap();
        assert_eq!(status, 42);
    }

    #[test]
    fn test_capabilities_raw_array_is_null_terminated() {
        let capabilities: Capabilities = [Capability::from_static(&ANSWER)].into_iter().collect();
        let raw = capabilities.to_raw();

        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0], &ANSWER as *const u32 as *mut c_void);
        assert!(raw[1].is_null());
    }

    #[test]
    fn test_null_is_not_a_capability() {
        assert!(Capability::from_raw(ptr::null_mut()).is_none());
    }

    #[test]
    fn test_capabilities_display() {
        assert_eq!(Capabilities::new().to_string(), "");

        let capabilities = Capabilities::new()
            .with(Capability::from_static(&ANSWER))
            .with(Capability::from_static(&ANSWER));
        let shown = capabilities.to_string();
        assert_eq!(shown.split(' ').count(), 2);
        assert!(shown.starts_with("0x"));
    }

    #[test]
    fn test_dlopen_missing_file() {
        let loader = DlopenLoader::new(Freshness::Portable);
        let err = loader
            .load(OsStr::new("/nonexistent/zygote/unit.so"))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Open { .. }));
    }

    #[test]
    fn test_freshness_parsing() {
        assert_eq!("deepbind".parse::<Freshness>().unwrap(), Freshness::Deepbind);
        assert_eq!("Portable".parse::<Freshness>().unwrap(), Freshness::Portable);
        assert!("eager".parse::<Freshness>().is_err());
    }

    #[test]
    fn test_portable_flags() {
        assert_eq!(Freshness::Portable.dlopen_flags(), RTLD_LAZY);
        assert!(Freshness::Portable.is_supported());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_deepbind_flags_on_glibc() {
        assert!(Freshness::Deepbind.is_supported());
        assert_ne!(Freshness::Deepbind.dlopen_flags() & libc::RTLD_DEEPBIND, 0);
    }
}
