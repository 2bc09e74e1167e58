//! Records shared by the piped agent and the control plane.
//!
//! Every cross reference between records is an id; records are never shared
//! mutably between stores.
pub mod application;
pub mod chain;
pub mod command;
pub mod deployment;
pub mod event;
pub mod livestate;
pub mod piped;
pub mod stage;

pub use application::*;
pub use chain::*;
pub use command::*;
pub use deployment::*;
pub use event::*;
pub use livestate::*;
pub use piped::*;

use serde::{Deserialize, Serialize};

/// Latest analysis result stored per application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub start_time: i64,
}
