//! Path validation and root-confinement helpers.
//!
//! The original engine resolved client paths with a bare `filepath.Join`.
//! This adds the traversal checks the original never had, modeled on the
//! safe-path helper.

use crate::error::StorageError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};
use std::path::{Component, Path, PathBuf};

/// Resolve `relative` against `base`, rejecting `..` components, absolute
/// paths, null bytes, and anything else that could escape `base`. Works on
/// paths that don't exist yet, unlike `canonicalize`.
pub fn safe_path(base: &Path, relative: &str) -> Result<PathBuf, StorageError> {
    if relative.contains('\0') {
        return Err(StorageError::Permission("path contains null byte".into()));
    }

    if relative.len() > MAX_PATH_LEN {
        return Err(StorageError::Permission(format!(
            "path too long: {} bytes (max {})",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    let relative_path = Path::new(relative);
    if relative_path.is_absolute() {
        return Err(StorageError::Permission("absolute paths not allowed".into()));
    }

    let mut result = base.to_path_buf();
    for component in relative_path.components() {
        match component {
            Component::Normal(name) => {
                let name_str = name.to_string_lossy();
                if name_str.len() > MAX_FILENAME_LEN {
                    return Err(StorageError::Permission(format!(
                        "filename too long: {} bytes (max {})",
                        name_str.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
            }
            Component::ParentDir => {
                return Err(StorageError::Permission("parent directory (..) not allowed".into()));
            }
            Component::CurDir => {}
            Component::Prefix(_) => {
                return Err(StorageError::Permission("path prefixes not allowed".into()));
            }
            Component::RootDir => {
                return Err(StorageError::Permission(
                    "root directory not allowed in relative path".into(),
                ));
            }
        }
    }

    if !result.starts_with(base) {
        return Err(StorageError::Permission("path escapes base directory".into()));
    }

    Ok(result)
}

/// Validate a single path component (a filename, not a full path).
pub fn validate_filename(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::Permission("empty filename".into()));
    }
    if name.contains('\0') {
        return Err(StorageError::Permission("filename contains null byte".into()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(StorageError::Permission(format!(
            "filename too long: {} bytes (max {})",
            name.len(),
            MAX_FILENAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(StorageError::Permission("special directory names not allowed".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(StorageError::Permission("filename contains path separator".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base() -> PathBuf {
        PathBuf::from("/shared")
    }

    #[test]
    fn normal_paths_resolve_under_base() {
        assert_eq!(safe_path(&base(), "file.txt").unwrap(), PathBuf::from("/shared/file.txt"));
        assert_eq!(
            safe_path(&base(), "dir/file.txt").unwrap(),
            PathBuf::from("/shared/dir/file.txt")
        );
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        assert!(safe_path(&base(), "../etc/passwd").is_err());
        assert!(safe_path(&base(), "/etc/passwd").is_err());
        assert!(safe_path(&base(), "foo/../../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_null_bytes() {
        assert!(safe_path(&base(), "file\0.txt").is_err());
    }

    #[test]
    fn works_on_nonexistent_paths() {
        let result = safe_path(&base(), "nonexistent/deep/path/file.txt");
        assert!(result.is_ok());
    }

    #[test]
    fn validate_filename_rejects_separators_and_dots() {
        assert!(validate_filename("file.txt").is_ok());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("a/b").is_err());
    }
}
