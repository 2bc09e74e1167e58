//! Git access through the `git` CLI: a mirror cache shared by every clone of
//! a repository and isolated working copies on top of it.
mod client;
mod repo;
mod ssh_config;
mod url;

pub use client::{Client, ClientOptions};
pub use repo::{Commit, Repo};
pub use ssh_config::{add_ssh_config, render_ssh_config};
pub use url::{make_commit_url, make_dir_url, parse_git_url};

use crate::error::KeelError;

pub type GitResult<T = (), E = GitError> = Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// The working tree had nothing to commit.
    #[error("no change")]
    NoChange,
    /// The remote branch moved since the last fetch.
    #[error("branch is not fresh, the remote has commits that are not fetched yet")]
    BranchNotFresh,
    #[error("git {command} failed ({underlying}): {output}")]
    CommandFailed {
        command: String,
        underlying: String,
        output: String,
    },
    #[error("git I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<GitError> for KeelError {
    fn from(err: GitError) -> Self {
        KeelError::GitOperationFailed(err.to_string())
    }
}
