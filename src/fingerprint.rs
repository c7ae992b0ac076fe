//! Content fingerprint of a module's source directory
//!
//! SHA-256 over every regular file below the module directory, visited
//! depth-first with siblings in file-name order. Each file contributes its relative path, a
//! NUL, its length, and its bytes, so moving content between files changes
//! the digest. Symlinks are hashed by target, not followed.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Hex-encoded SHA-256 of `dir`
pub fn fingerprint_dir(dir: &Path) -> io::Result<String> {
    fs::metadata(dir)?;
    let mut hasher = Sha256::new();

    // Symlinked directories are hashed as links, never entered
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let kind = entry.file_type();
        if kind.is_dir() {
            continue;
        }
        let content = if kind.is_symlink() {
            fs::read_link(entry.path())?
                .into_os_string()
                .into_encoded_bytes()
        } else if kind.is_file() {
            fs::read(entry.path())?
        } else {
            continue;
        };

        let rel = entry.path().strip_prefix(dir).map_err(io::Error::other)?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        dir
    }

    #[test]
    fn test_identical_trees_match() {
        let a = tree(&[("setup.sh", "echo hi"), ("lib/util.sh", "x=1")]);
        let b = tree(&[("lib/util.sh", "x=1"), ("setup.sh", "echo hi")]);
        let fa = fingerprint_dir(a.path()).unwrap();
        assert_eq!(fa, fingerprint_dir(b.path()).unwrap());
        assert_eq!(fa.len(), 64);
    }

    #[test]
    fn test_content_change_is_detected() {
        let dir = tree(&[("setup.sh", "echo hi")]);
        let before = fingerprint_dir(dir.path()).unwrap();
        fs::write(dir.path().join("setup.sh"), "echo bye").unwrap();
        assert_ne!(before, fingerprint_dir(dir.path()).unwrap());
    }

    #[test]
    fn test_rename_is_detected() {
        let a = tree(&[("a.sh", "same")]);
        let b = tree(&[("b.sh", "same")]);
        assert_ne!(
            fingerprint_dir(a.path()).unwrap(),
            fingerprint_dir(b.path()).unwrap()
        );
    }

    #[test]
    fn test_nested_files_are_included() {
        let dir = tree(&[("setup.sh", "echo hi"), ("lib/deep/util.sh", "x=1")]);
        let before = fingerprint_dir(dir.path()).unwrap();
        fs::write(dir.path().join("lib/deep/util.sh"), "x=2").unwrap();
        assert_ne!(before, fingerprint_dir(dir.path()).unwrap());
    }

    #[test]
    fn test_symlink_hashed_by_target() {
        let a = tree(&[("setup.sh", "echo hi"), ("one.conf", "1"), ("two.conf", "1")]);
        std::os::unix::fs::symlink("one.conf", a.path().join("current.conf")).unwrap();
        let before = fingerprint_dir(a.path()).unwrap();

        // Same bytes behind a different target still changes the digest
        fs::remove_file(a.path().join("current.conf")).unwrap();
        std::os::unix::fs::symlink("two.conf", a.path().join("current.conf")).unwrap();
        assert_ne!(before, fingerprint_dir(a.path()).unwrap());
    }

    #[test]
    fn test_symlinked_directory_is_not_followed() {
        let outside = tree(&[("big.bin", "payload")]);
        let dir = tree(&[("setup.sh", "echo hi")]);
        std::os::unix::fs::symlink(outside.path(), dir.path().join("vendor")).unwrap();
        let before = fingerprint_dir(dir.path()).unwrap();

        fs::write(outside.path().join("big.bin"), "changed").unwrap();
        assert_eq!(before, fingerprint_dir(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_dir_is_error() {
        assert!(fingerprint_dir(Path::new("/nonexistent/modhost/module")).is_err());
    }
}
