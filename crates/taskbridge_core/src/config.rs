//! Session configuration.
//!
//! # Responsibility
//! - Describe where the backing database lives and how pages are sized.
//! - Carry optional file-logging settings applied by `Session::open`.

use crate::db::DEFAULT_BUSY_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Backing database location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DatabaseLocation {
    #[default]
    InMemory,
    File(PathBuf),
}

impl DatabaseLocation {
    /// Short label used in log events.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::InMemory => "memory",
            Self::File(_) => "file",
        }
    }
}

/// Settings for opening a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub database: DatabaseLocation,
    pub busy_timeout: Duration,
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// File logging is initialized only when both level and directory are set.
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            database: DatabaseLocation::InMemory,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            log_level: None,
            log_dir: None,
        }
    }
}

impl BridgeConfig {
    /// Configuration for a database file at `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseLocation::File(path.into()),
            ..Self::default()
        }
    }

    /// Normalizes a requested page size: zero falls back to the default and
    /// oversized requests are clamped.
    pub fn page_size(&self, requested: u32) -> u32 {
        let max = self.max_page_size.max(1);
        match requested {
            0 => self.default_page_size.clamp(1, max),
            size => size.min(max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BridgeConfig, DatabaseLocation};

    #[test]
    fn page_size_normalization() {
        let config = BridgeConfig::default();
        assert_eq!(config.page_size(0), 20);
        assert_eq!(config.page_size(7), 7);
        assert_eq!(config.page_size(500), 100);
    }

    #[test]
    fn location_modes() {
        assert_eq!(DatabaseLocation::InMemory.mode(), "memory");
        assert_eq!(BridgeConfig::with_file("/tmp/x.db").database.mode(), "file");
    }
}
