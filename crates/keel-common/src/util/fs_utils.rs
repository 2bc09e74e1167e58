use std::path::Path;

use walkdir::WalkDir;

use crate::error::KeelResult;

pub fn make_dirs(path: &Path) -> KeelResult<()> {
    tracing::debug!("Creating directories: {}", path.display());
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Recursively copies `src` into `dest`, creating `dest` when needed.
pub fn copy_dir(src: &Path, dest: &Path) -> KeelResult<()> {
    make_dirs(dest)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| anyhow::anyhow!(e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| anyhow::anyhow!(e))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            make_dirs(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            }
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Writes `data` to `path`, creating the parent directories first.
pub fn write_file(path: &Path, data: &[u8]) -> KeelResult<()> {
    if let Some(parent) = path.parent() {
        make_dirs(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_tree() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("a/b/c.txt"), b"hello").unwrap();
        write_file(&src.path().join("top.txt"), b"top").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("copy");
        copy_dir(src.path(), &target).unwrap();

        assert_eq!(std::fs::read(target.join("a/b/c.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(target.join("top.txt")).unwrap(), b"top");
    }
}
