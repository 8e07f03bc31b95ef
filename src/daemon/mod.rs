/// Zygote daemon and grow client
///
/// - `protocol`: wire framing of requests and replies
/// - `descriptor`: standard stream transfer over the socket (SCM_RIGHTS)
/// - `loader`: resolving and invoking code units
/// - `endpoint`: the listening socket and its cleanup
/// - `server`: accept loop, one fork per connection
/// - `worker`: the forked child that becomes the requested process
/// - `client`: the grow side of the protocol
/// - `config`: daemon settings

pub mod protocol;
pub mod descriptor;
pub mod loader;
pub mod endpoint;
pub mod config;
pub mod server;
pub mod worker;
pub mod client;

pub use protocol::{Request, PROTOCOL_VERSION};
pub use descriptor::{DescriptorChannel, StandardStreams};
pub use loader::{
    run_direct, run_linked, Capabilities, Capability, CodeUnit, DlopenLoader, Freshness,
    ImageLoader, StaticLoader, UnitFn, UnitLoader,
};
pub use endpoint::Endpoint;
pub use config::ZygoteConfig;
pub use server::{Terminated, Zygote};
pub use client::{GrowClient, Growth};
