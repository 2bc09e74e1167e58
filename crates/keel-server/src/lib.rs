//! The control-plane side of the piped API.
pub mod app_state;
pub mod error;
pub mod local;
pub mod piped_api;
pub mod routes;
pub mod server;
pub mod utils;

pub use error::{KeelServerError, KeelServerResult};
pub use local::LocalClient;
pub use piped_api::{Caller, PipedApi};
pub use server::Server;
