//! Cross-platform application paths

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DaemonError;

/// Overrides the platform data directory when set.
pub const DATA_DIR_ENV: &str = "NEURITE_DATA_DIR";

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, DaemonError> {
        let data_dir = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => Self::get_data_dir()?,
        };
        Self::at(data_dir)
    }

    /// Use `data_dir` as the root, creating it if needed.
    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| {
            DaemonError::Paths(format!("failed to create data directory: {}", e))
        })?;
        Ok(Self { data_dir })
    }

    fn get_data_dir() -> Result<PathBuf, DaemonError> {
        let base = dirs::data_dir()
            .ok_or_else(|| DaemonError::Paths("could not determine data directory".into()))?;
        Ok(base.join("neurite"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.data_dir.join("substrate.nck")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn telemetry_file(&self) -> PathBuf {
        self.data_dir.join("telemetry.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_under_the_data_dir() {
        let root = std::env::temp_dir().join(format!("neurited-paths-{}", std::process::id()));
        let paths = AppPaths::at(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(paths.data_dir(), root.as_path());
        assert_eq!(paths.checkpoint_file(), root.join("substrate.nck"));
        assert_eq!(paths.config_file(), root.join("config.json"));
        assert_eq!(paths.telemetry_file(), root.join("telemetry.jsonl"));
        let _ = fs::remove_dir_all(&root);
    }
}
