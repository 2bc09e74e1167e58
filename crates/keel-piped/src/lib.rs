//! The piped agent: watches Git, plans and runs deployments, keeps the
//! live state of the applications and reports everything to the control
//! plane.
pub mod admin;
pub mod apiclient;
pub mod apistore;
pub mod appconfigreporter;
pub mod controller;
pub mod deploysource;
pub mod driftdetector;
pub mod error;
pub mod eventwatcher;
pub mod executor;
pub mod kubernetes;
pub mod livestatereporter;
pub mod livestatestore;
pub mod logpersister;
pub mod metadatastore;
pub mod piped;
pub mod planner;
pub mod repocache;
pub mod supervisor;
pub mod toolregistry;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use error::{KeelPipedError, KeelPipedResult};
pub use piped::{Piped, PipedOptions};
