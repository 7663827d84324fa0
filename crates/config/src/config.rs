//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Maximum concurrent encodes (0 = default of 2)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Encoder threads per job (0 = auto-derive)
    #[serde(default)]
    pub threads_per_job: u32,
    /// Seconds a failed or cancelled job keeps its files before sweep
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
}

fn default_failed_retention_secs() -> u64 {
    3600
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            threads_per_job: 0,
            failed_retention_secs: default_failed_retention_secs(),
        }
    }
}

/// Encoder binary and selection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Probe hardware encoders before falling back to software (default true)
    #[serde(default = "default_prefer_hardware")]
    pub prefer_hardware: bool,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_prefer_hardware() -> bool {
    true
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            prefer_hardware: default_prefer_hardware(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory for encoded outputs and pass logs
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Directory for persisted job records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/smart-compressor")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp/smart-compressor/jobs")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parse a boolean the way the env overrides accept it
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SC_LOGICAL_CORES -> cpu.logical_cores
    /// - SC_TARGET_CPU_UTILIZATION -> cpu.target_cpu_utilization
    /// - SC_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    /// - SC_THREADS_PER_JOB -> jobs.threads_per_job
    /// - SC_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - SC_FFPROBE_PATH -> encoder.ffprobe_path
    /// - SC_PREFER_HARDWARE -> encoder.prefer_hardware
    /// - SC_WORK_DIR -> paths.work_dir
    /// - SC_STATE_DIR -> paths.state_dir
    /// - SC_LOG_LEVEL -> logging.level
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SC_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("SC_TARGET_CPU_UTILIZATION") {
            if let Ok(util) = val.parse::<f32>() {
                self.cpu.target_cpu_utilization = util;
            }
        }

        if let Ok(val) = env::var("SC_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("SC_THREADS_PER_JOB") {
            if let Ok(threads) = val.parse::<u32>() {
                self.jobs.threads_per_job = threads;
            }
        }

        if let Ok(val) = env::var("SC_FFMPEG_PATH") {
            if !val.is_empty() {
                self.encoder.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SC_FFPROBE_PATH") {
            if !val.is_empty() {
                self.encoder.ffprobe_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SC_PREFER_HARDWARE") {
            if let Some(prefer) = parse_bool(&val) {
                self.encoder.prefer_hardware = prefer;
            }
        }

        if let Ok(val) = env::var("SC_WORK_DIR") {
            if !val.is_empty() {
                self.paths.work_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SC_STATE_DIR") {
            if !val.is_empty() {
                self.paths.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SC_LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration if the file exists, otherwise start from defaults.
    ///
    /// Environment overrides are applied in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }
}
