//! History store configuration.

use serde::Deserialize;

/// Configuration for the persistent message store.
///
/// Lives under `[history]` in the bouncer config file.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database")]
    pub database: String,
    /// Days to keep channel messages. 0 disables channel retention.
    #[serde(default)]
    pub retention_days_channel: u32,
    /// Days to keep private messages. 0 disables PM retention.
    #[serde(default)]
    pub retention_days_pm: u32,
    /// Minutes between retention cleanup runs.
    #[serde(default = "default_cleanup_interval")]
    pub retention_cleanup_interval: u64,
    /// SQLite page cache size in KB.
    #[serde(default = "default_cache_size_kb")]
    pub cache_size_kb: u32,
    /// SQLite mmap size in bytes. 0 disables memory-mapped I/O.
    #[serde(default)]
    pub mmap_size_bytes: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            retention_days_channel: 0,
            retention_days_pm: 0,
            retention_cleanup_interval: default_cleanup_interval(),
            cache_size_kb: default_cache_size_kb(),
            mmap_size_bytes: 0,
        }
    }
}

impl HistoryConfig {
    /// Whether any retention class is enabled.
    pub fn retention_enabled(&self) -> bool {
        self.retention_days_channel > 0 || self.retention_days_pm > 0
    }
}

fn default_database() -> String {
    "history.db".to_string()
}

fn default_cleanup_interval() -> u64 {
    1440
}

fn default_cache_size_kb() -> u32 {
    2000
}
