//! Configuration sections. Everything here is fixed for the process lifetime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Filesystem locations for profile artifacts and the access log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory that receives `cpu.prof`, `heap.prof`, ... on finalize.
    /// Default: /tmp/benchlog
    #[serde(default = "PathsConfig::default_output_dir")]
    pub output_dir: PathBuf,

    /// Access log file. Relative paths resolve against `output_dir`.
    /// Default: logalp.txt
    #[serde(default = "PathsConfig::default_access_log")]
    pub access_log: PathBuf,
}

impl PathsConfig {
    fn default_output_dir() -> PathBuf {
        PathBuf::from("/tmp/benchlog")
    }

    fn default_access_log() -> PathBuf {
        PathBuf::from("logalp.txt")
    }

    /// Absolute location of the access log.
    pub fn access_log_path(&self) -> PathBuf {
        if self.access_log.is_absolute() {
            self.access_log.clone()
        } else {
            self.output_dir.join(&self.access_log)
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: Self::default_output_dir(),
            access_log: Self::default_access_log(),
        }
    }
}

/// External marker command used to tell the log collector where sessions begin and end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Command invoked as `<command> <verb> [id]`.
    /// Default: /usr/bin/logger.sh
    #[serde(default = "MarkerConfig::default_command")]
    pub command: String,

    /// Shell that receives the invocation on stdin (`<shell> -s`).
    /// Default: /bin/bash
    #[serde(default = "MarkerConfig::default_shell")]
    pub shell: PathBuf,
}

impl MarkerConfig {
    fn default_command() -> String {
        "/usr/bin/logger.sh".to_string()
    }

    fn default_shell() -> PathBuf {
        PathBuf::from("/bin/bash")
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            shell: Self::default_shell(),
        }
    }
}

/// Profiling session behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingConfig {
    /// Capture an execution trace alongside the CPU profile.
    /// Default: false
    #[serde(default)]
    pub trace: bool,

    /// Benchmark window in seconds before a session finalizes on its own.
    /// Default: 60
    #[serde(default = "ProfilingConfig::default_benchmark_secs")]
    pub benchmark_secs: u64,

    /// Record contention (block/mutex) data at maximum granularity.
    /// Default: true
    #[serde(default = "ProfilingConfig::default_contention_sampling")]
    pub contention_sampling: bool,

    /// CPU sampling frequency in Hz, for backends that sample.
    /// Default: 99
    #[serde(default = "ProfilingConfig::default_cpu_frequency")]
    pub cpu_frequency: i32,

    /// Interval between execution trace samples in milliseconds.
    /// Default: 10
    #[serde(default = "ProfilingConfig::default_trace_interval_ms")]
    pub trace_interval_ms: u64,
}

impl ProfilingConfig {
    fn default_benchmark_secs() -> u64 {
        60
    }

    fn default_contention_sampling() -> bool {
        true
    }

    fn default_cpu_frequency() -> i32 {
        99
    }

    fn default_trace_interval_ms() -> u64 {
        10
    }

    pub fn benchmark_duration(&self) -> Duration {
        Duration::from_secs(self.benchmark_secs)
    }

    pub fn trace_interval(&self) -> Duration {
        Duration::from_millis(self.trace_interval_ms.max(1))
    }
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            trace: false,
            benchmark_secs: Self::default_benchmark_secs(),
            contention_sampling: Self::default_contention_sampling(),
            cpu_frequency: Self::default_cpu_frequency(),
            trace_interval_ms: Self::default_trace_interval_ms(),
        }
    }
}

/// Network bind address for the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Default: 8080
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_http_port() -> u16 {
        8080
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
