pub mod config;
pub mod error;
pub mod git;
pub mod model;
pub mod rpc;
pub mod settings;
pub mod util;

// Re-exports
pub use ::tracing::{self, debug, error, info, metadata, trace, warn};
pub use util::*;

pub use util::cache::{self, CryptoHash};
