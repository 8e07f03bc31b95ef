// Library interface for the zygote daemon and grow client
// Hosts embed the daemon; the grow and zygoted binaries are thin wrappers

pub mod daemon;
pub mod error;
pub mod logging;
pub mod signal;

pub use daemon::{
    Capabilities, Capability, GrowClient, Request, Zygote, ZygoteConfig, PROTOCOL_VERSION,
};
pub use error::{
    GrowError, LoadError, ProtocolError, ZygoteError, EXIT_DISPATCH_FAILURE,
    EXIT_TRANSPORT_FAILURE, EXIT_USAGE,
};
