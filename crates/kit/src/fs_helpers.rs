//! Filesystem helpers (C2): idempotent directory creation, recursive
//! delete, and in-place text substitution.
//!
//! Grounded in `filesystem_service.py`'s thin wrapper over
//! `ensure_directory`/`remove_directory`/`ensure_parent_directory`/
//! `replace_in_file`.

use camino::Utf8Path;

use crate::error::{PipelineError, Result};

/// Ensure a directory exists, creating all parents as needed.
///
/// Idempotence law: `ensure_dir(p); ensure_dir(p)` has the same effect as
/// `ensure_dir(p)` once.
pub fn ensure_dir(path: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| PipelineError::Filesystem(format!("creating directory {path}: {e}")))?;
    tracing::debug!("Ensured directory exists: {path}");
    Ok(())
}

/// Remove a directory tree. Not an error if it doesn't exist.
pub fn remove_dir_all_if_exists(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            tracing::debug!("Removed directory: {path}");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::Filesystem(format!(
            "removing directory {path}: {e}"
        ))),
    }
}

/// Ensure the parent directory of a file path exists.
pub fn ensure_parent_dir(file_path: &Utf8Path) -> Result<()> {
    if let Some(parent) = file_path.parent() {
        if !parent.as_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    Ok(())
}

/// Replace every occurrence of each `(pattern, replacement)` pair in a
/// file's text content, in order.
pub fn replace_in_file(path: &Utf8Path, replacements: &[(&str, &str)]) -> Result<()> {
    let mut content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Filesystem(format!("reading {path}: {e}")))?;
    for (pattern, replacement) in replacements {
        content = content.replace(pattern, replacement);
    }
    std::fs::write(path, content)
        .map_err(|e| PipelineError::Filesystem(format!("writing {path}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn utf8_tempdir() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let (_dir, root) = utf8_tempdir();
        let target = root.join("a/b/c");
        ensure_dir(&target).unwrap();
        ensure_dir(&target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn remove_dir_all_if_exists_tolerates_absence() {
        let (_dir, root) = utf8_tempdir();
        let target = root.join("never-created");
        remove_dir_all_if_exists(&target).unwrap();
    }

    #[test]
    fn replace_in_file_applies_all_pairs() {
        let (_dir, root) = utf8_tempdir();
        let file = root.join("recipe.txt");
        std::fs::write(&file, "FROM <BASE>\nRUN <CMD>\n").unwrap();
        replace_in_file(&file, &[("<BASE>", "fedora"), ("<CMD>", "true")]).unwrap();
        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content, "FROM fedora\nRUN true\n");
    }
}
