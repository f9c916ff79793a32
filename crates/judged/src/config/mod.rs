use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::language::{DEFAULT_SANDBOX_PATH, Language, SandboxFileName};
use crate::runner::ComparisonPolicy;
use crate::types::MountConfig;

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Used by `judged init` and as the configuration when no file is given.
pub const EXAMPLE_CONFIG: &str = include_str!("../../judged.example.toml");

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "JUDGED";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid sandbox file name {0:?}: must be a single path component")]
    InvalidFileName(String),

    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for the judge daemon
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub isolate_path: Option<PathBuf>,

    /// Use cgroup memory limiting instead of RLIMIT_AS.
    ///
    /// When enabled, isolate uses `--cg` and `--cg-mem` which limit actual memory
    /// usage (RSS) rather than virtual address space. Required for runtimes like
    /// the JVM and Go that map large amounts of virtual memory.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// Directory mounts applied to every sandbox run (compile and grade).
    #[serde(default)]
    pub sandbox_mounts: Vec<MountConfig>,

    /// Host directory for isolate meta files, kept outside every box.
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,

    /// Number of execution slots; defaults to the number of CPUs.
    #[serde(default)]
    pub slots: Option<u32>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    /// How produced output is compared against the expected answer
    #[serde(default)]
    pub comparison: ComparisonPolicy,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

/// Local artifact cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,

    /// Upper bound on bytes held by cache entries
    #[serde(default = "default_cache_budget")]
    pub budget_bytes: u64,

    /// Headroom kept free when admitting a new entry
    #[serde(default = "default_safety_margin")]
    pub safety_margin_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            budget_bytes: default_cache_budget(),
            safety_margin_bytes: default_safety_margin(),
        }
    }
}

/// Filesystem object store settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Spool directory broker settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// How often an idle consumer rescans the spool
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deliveries after which a failing task is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl Config {
    /// The embedded example configuration
    pub fn example() -> Result<Self, ConfigError> {
        Self::parse_toml(EXAMPLE_CONFIG)
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            isolate_path: None,
            cgroup: false,
            cg_root: default_cg_root(),
            sandbox_mounts: Vec::new(),
            meta_dir: default_meta_dir(),
            slots: None,
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            broker: BrokerConfig::default(),
            comparison: ComparisonPolicy::default(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by ID
    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    /// Get the path to the isolate binary
    pub fn isolate_binary(&self) -> PathBuf {
        self.isolate_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }

    /// Number of execution slots the daemon runs
    pub fn slot_count(&self) -> u32 {
        self.slots
            .unwrap_or_else(|| u32::try_from(num_cpus::get()).unwrap_or(u32::MAX))
            .max(1)
    }
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("/run/judged")
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("/var/cache/judged")
}

fn default_cache_budget() -> u64 {
    1024 * 1024 * 1024
}

fn default_safety_margin() -> u64 {
    16 * 1024 * 1024
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/judged/storage")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/lib/judged/spool")
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_deliveries() -> u32 {
    3
}
