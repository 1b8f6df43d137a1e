//! Layered configuration loading for benchlog.
//!
//! All values are read once at startup and never change afterwards. The
//! profiling coordinator and the access-log recorder are built from them.
//!
//! # Usage
//!
//! ```rust,no_run
//! use benchconf::BenchConfig;
//!
//! let config = BenchConfig::load().expect("Failed to load config");
//! println!("Artifacts go to {}", config.paths.output_dir.display());
//! println!("Benchmark window: {}s", config.profiling.benchmark_secs);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/benchlog/config.toml` (system)
//! 2. `~/.config/benchlog/config.toml` (user)
//! 3. `./benchlog.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`BENCHLOG_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! output_dir = "/tmp/benchlog"
//! access_log = "logalp.txt"
//!
//! [marker]
//! command = "/usr/bin/logger.sh"
//! shell = "/bin/bash"
//!
//! [profiling]
//! trace = false
//! benchmark_secs = 60
//! contention_sampling = true
//!
//! [bind]
//! http_port = 8080
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod infra;
pub mod loader;

pub use infra::{BindConfig, MarkerConfig, PathsConfig, ProfilingConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete benchlog configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BenchConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub marker: MarkerConfig,

    #[serde(default)]
    pub profiling: ProfilingConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl BenchConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` replacing the local override.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = BenchConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::load_into(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# benchlog configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "output_dir = {}\n",
            toml_path(&self.paths.output_dir)
        ));
        output.push_str(&format!(
            "access_log = {}\n",
            toml_path(&self.paths.access_log)
        ));

        output.push_str("\n[marker]\n");
        output.push_str(&format!("command = {}\n", toml_str(&self.marker.command)));
        output.push_str(&format!("shell = {}\n", toml_path(&self.marker.shell)));

        output.push_str("\n[profiling]\n");
        output.push_str(&format!("trace = {}\n", self.profiling.trace));
        output.push_str(&format!(
            "benchmark_secs = {}\n",
            self.profiling.benchmark_secs
        ));
        output.push_str(&format!(
            "contention_sampling = {}\n",
            self.profiling.contention_sampling
        ));
        output.push_str(&format!(
            "cpu_frequency = {}\n",
            self.profiling.cpu_frequency
        ));
        output.push_str(&format!(
            "trace_interval_ms = {}\n",
            self.profiling.trace_interval_ms
        ));

        output.push_str("\n[bind]\n");
        output.push_str(&format!("host = {}\n", toml_str(&self.bind.host)));
        output.push_str(&format!("http_port = {}\n", self.bind.http_port));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = {}\n", toml_str(&self.telemetry.log_level)));

        output
    }
}

/// Quoted and escaped TOML string literal.
fn toml_str(value: &str) -> String {
    toml::Value::String(value.to_owned()).to_string()
}

fn toml_path(path: &std::path::Path) -> String {
    toml_str(&path.to_string_lossy())
}
