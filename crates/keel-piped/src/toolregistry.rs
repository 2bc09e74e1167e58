//! Locates the external binaries used by executors.
use std::{
    env,
    path::{Path, PathBuf},
    sync::OnceLock,
};

static REGISTRY: OnceLock<ToolRegistry> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    bin_dir: PathBuf,
}

impl ToolRegistry {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }

    /// Installs the process wide registry. Later calls are ignored.
    pub fn init(bin_dir: impl Into<PathBuf>) -> &'static ToolRegistry {
        REGISTRY.get_or_init(|| ToolRegistry::new(bin_dir))
    }

    /// The installed registry, or one rooted at `~/.keel/tools` otherwise.
    pub fn global() -> &'static ToolRegistry {
        REGISTRY.get_or_init(|| {
            let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_else(env::temp_dir);
            ToolRegistry::new(home.join(".keel").join("tools"))
        })
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Finds `name` in the tool directory first, then on `PATH`.
    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        let local = self.bin_dir.join(name);
        if local.is_file() {
            return Some(local);
        }
        env::var_os("PATH").and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(name))
                .find(|p| p.is_file())
        })
    }

    pub fn kubectl(&self) -> Option<PathBuf> {
        self.lookup("kubectl")
    }

    pub fn kustomize(&self) -> Option<PathBuf> {
        self.lookup("kustomize")
    }

    pub fn helm(&self) -> Option<PathBuf> {
        self.lookup("helm")
    }

    /// `PATH` with the tool directory prepended.
    pub fn path_env(&self) -> String {
        let mut dirs = vec![self.bin_dir.clone()];
        if let Some(paths) = env::var_os("PATH") {
            dirs.extend(env::split_paths(&paths));
        }
        env::join_paths(dirs)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| self.bin_dir.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_the_tool_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kubectl"), "#!/bin/sh\n").unwrap();
        let registry = ToolRegistry::new(dir.path());
        assert_eq!(registry.kubectl(), Some(dir.path().join("kubectl")));
        assert!(registry.lookup("definitely-not-a-tool").is_none());
        assert!(registry
            .path_env()
            .starts_with(dir.path().to_string_lossy().as_ref()));
    }
}
