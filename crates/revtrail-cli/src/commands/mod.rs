//! CLI command implementations for revtrail.

pub mod check;
pub mod history;
pub mod revision;

use anyhow::{Context, Result, bail};
use revtrail_audit::FileStore;
use std::path::Path;

/// Open an existing audit log for reading.
///
/// A missing file is an error; opening would otherwise create an empty log.
pub(crate) fn open_log(log: &Path) -> Result<FileStore> {
    if !log.exists() {
        bail!("Audit log {} does not exist", log.display());
    }
    FileStore::open(log).with_context(|| format!("Failed to open audit log {}", log.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_log_is_not_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("typo.log");

        let err = open_log(&path).err().unwrap();
        assert!(err.to_string().contains("does not exist"));
        assert!(!path.exists());
    }

    #[test]
    fn test_existing_log_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, "").unwrap();

        assert!(open_log(&path).is_ok());
    }
}
