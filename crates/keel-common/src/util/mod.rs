pub mod backoff;
pub mod cache;
pub mod command;
pub mod fs_utils;
pub mod path_matcher;
pub mod template;
pub mod time;
pub mod tracing;
