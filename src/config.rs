//! Configuration management for greplens
//!
//! Supports loading configuration from TOML files with programmatic overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

/// Project-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Base directory for scanning and gitignore resolution
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

/// Indexer-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Glob patterns to include (empty means include all)
    #[serde(default)]
    pub include: Vec<String>,

    /// Glob patterns to exclude
    #[serde(default = "default_exclude_patterns")]
    pub exclude: Vec<String>,

    /// Maximum file size to index in bytes (default 10MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Best-effort cap on the total indexed content size
    #[serde(default = "default_max_total_size_mb")]
    pub max_total_size_mb: u64,

    /// Best-effort cap on the number of indexed files
    #[serde(default = "default_max_file_count")]
    pub max_file_count: usize,

    /// Resolve and follow symlinks while scanning; cycles are always broken
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Demote oversized files to lower task priority
    #[serde(default)]
    pub smart_size_control: bool,

    /// Task priority assignment policy
    #[serde(default)]
    pub priority_mode: PriorityMode,

    /// Start the file watcher after the initial index build
    #[serde(default)]
    pub watch_mode: bool,

    /// Coalescing window for file watcher events, in milliseconds
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,

    /// Exclude paths matched by the root-level gitignore
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
}

/// Task priority assignment policy for the scanner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// Recently modified files first
    Recent,
    /// Fixed priority table by extension
    #[default]
    Static,
}

/// Worker and memory tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Soft memory threshold in MB; enforcement is gated by feature flags
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// Number of processor worker threads (0 = number of cores)
    #[serde(default)]
    pub max_workers: usize,

    /// Generic debounce for background work, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Search behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_max_context_lines")]
    pub max_context_lines: usize,

    #[serde(default)]
    pub enable_fuzzy: bool,

    #[serde(default)]
    pub merge_file_results: bool,

    #[serde(default)]
    pub ensure_complete_stmt: bool,
}

/// Gates for the memory-pressure degradation behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Defer new indexing operations when over the memory threshold
    #[serde(default)]
    pub enable_memory_limits: bool,

    /// Also suspend searches when over the memory threshold
    #[serde(default)]
    pub enable_graceful_degradation: bool,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
        "**/.git/**".to_string(),
        "**/build/**".to_string(),
        "**/dist/**".to_string(),
        "**/__pycache__/**".to_string(),
        "**/venv/**".to_string(),
        "**/.venv/**".to_string(),
    ]
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_max_total_size_mb() -> u64 {
    2048
}

fn default_max_file_count() -> usize {
    500_000
}

fn default_watch_debounce_ms() -> u64 {
    500
}

fn default_max_memory_mb() -> u64 {
    1024
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_max_results() -> usize {
    1000
}

fn default_max_context_lines() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: default_exclude_patterns(),
            max_file_size: default_max_file_size(),
            max_total_size_mb: default_max_total_size_mb(),
            max_file_count: default_max_file_count(),
            follow_symlinks: false,
            smart_size_control: false,
            priority_mode: PriorityMode::default(),
            watch_mode: false,
            watch_debounce_ms: default_watch_debounce_ms(),
            respect_gitignore: true,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_workers: 0,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            max_context_lines: default_max_context_lines(),
            enable_fuzzy: false,
            merge_file_results: false,
            ensure_complete_stmt: false,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the first default location that
    /// exists: the `GREPLENS_CONFIG` environment variable, `greplens.toml`
    /// in the working directory, then the user config directory.
    pub fn from_default_locations() -> Result<Option<(Self, PathBuf)>> {
        let candidates = [
            std::env::var_os("GREPLENS_CONFIG").map(PathBuf::from),
            Some(PathBuf::from("greplens.toml")),
            dirs::config_dir().map(|dir| dir.join("greplens").join("config.toml")),
        ];

        candidates
            .into_iter()
            .flatten()
            .find(|path| path.exists())
            .map(|path| Self::from_file(&path).map(|config| (config, path)))
            .transpose()
    }

    /// Configuration rooted at the given directory, defaults otherwise
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            project: ProjectConfig { root: root.into() },
            ..Default::default()
        }
    }

    /// Number of processor workers after resolving the 0 = auto default
    pub fn worker_count(&self) -> usize {
        if self.performance.max_workers > 0 {
            self.performance.max_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}
