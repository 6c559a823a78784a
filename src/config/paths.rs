//! Path resolution for rollsync configuration and data files.
//!
//! All rollsync data is stored in `~/.rollsync/` (or `$ROLLSYNC_HOME`):
//! - `config.yaml` - Main configuration file
//! - `rollsync.db` - SQLite database holding the operation queue and cache

use std::path::PathBuf;

use crate::error::RollsyncError;

/// Environment variable that overrides the data root.
pub const HOME_ENV: &str = "ROLLSYNC_HOME";

/// Paths to rollsync configuration and data files.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root directory: `~/.rollsync/`
    pub root: PathBuf,
    /// Config file: `~/.rollsync/config.yaml`
    pub config_file: PathBuf,
    /// Database file: `~/.rollsync/rollsync.db`
    pub database: PathBuf,
}

impl Paths {
    /// Resolve paths from `$ROLLSYNC_HOME`, falling back to `~/.rollsync`.
    ///
    /// # Errors
    ///
    /// Returns an error if neither variable is set.
    pub fn new() -> Result<Self, RollsyncError> {
        if let Ok(root) = std::env::var(HOME_ENV) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }

        let home = std::env::var("HOME").map_err(|_| {
            RollsyncError::Config("Could not determine home directory".to_string())
        })?;

        Ok(Self::with_root(PathBuf::from(home).join(".rollsync")))
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            config_file: root.join("config.yaml"),
            database: root.join("rollsync.db"),
            root,
        }
    }

    /// Ensure the root directory exists.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn ensure_dirs(&self) -> Result<(), RollsyncError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| {
                RollsyncError::Config(format!(
                    "Failed to create directory {}: {e}",
                    self.root.display()
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_with_root() {
        let root = PathBuf::from("/tmp/test-rollsync");
        let paths = Paths::with_root(root.clone());

        assert_eq!(paths.root, root);
        assert_eq!(paths.config_file, root.join("config.yaml"));
        assert_eq!(paths.database, root.join("rollsync.db"));
    }

    #[test]
    fn test_ensure_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_root(temp_dir.path().join("nested").join("root"));

        paths.ensure_dirs().unwrap();

        assert!(paths.root.exists());
    }
}
