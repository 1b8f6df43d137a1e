//! Config file discovery, loading, and environment variable overlay.

use crate::{BenchConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/benchlog/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("benchlog/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("benchlog.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and apply the values it sets on top of `config`.
pub fn load_into(config: &mut BenchConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

/// Apply only the keys present in `contents`, leaving everything else untouched.
///
/// Field-by-field so that a later file can override a single value without
/// resetting the rest of a section back to defaults.
fn apply_toml(config: &mut BenchConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let invalid = |key: &str, expected: &str| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("{key} must be {expected}"),
    };

    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("output_dir") {
            let v = v.as_str().ok_or_else(|| invalid("paths.output_dir", "a string"))?;
            config.paths.output_dir = expand_path(v);
        }
        if let Some(v) = paths.get("access_log") {
            let v = v.as_str().ok_or_else(|| invalid("paths.access_log", "a string"))?;
            config.paths.access_log = expand_path(v);
        }
    }

    if let Some(marker) = table.get("marker").and_then(|v| v.as_table()) {
        if let Some(v) = marker.get("command") {
            let v = v.as_str().ok_or_else(|| invalid("marker.command", "a string"))?;
            config.marker.command = v.to_string();
        }
        if let Some(v) = marker.get("shell") {
            let v = v.as_str().ok_or_else(|| invalid("marker.shell", "a string"))?;
            config.marker.shell = expand_path(v);
        }
    }

    if let Some(profiling) = table.get("profiling").and_then(|v| v.as_table()) {
        if let Some(v) = profiling.get("trace") {
            config.profiling.trace = v
                .as_bool()
                .ok_or_else(|| invalid("profiling.trace", "a boolean"))?;
        }
        if let Some(v) = profiling.get("benchmark_secs") {
            let secs = v
                .as_integer()
                .filter(|s| *s >= 0)
                .ok_or_else(|| invalid("profiling.benchmark_secs", "a non-negative integer"))?;
            config.profiling.benchmark_secs = secs as u64;
        }
        if let Some(v) = profiling.get("contention_sampling") {
            config.profiling.contention_sampling = v
                .as_bool()
                .ok_or_else(|| invalid("profiling.contention_sampling", "a boolean"))?;
        }
        if let Some(v) = profiling.get("cpu_frequency") {
            let hz = v
                .as_integer()
                .filter(|hz| *hz > 0 && *hz <= i32::MAX as i64)
                .ok_or_else(|| invalid("profiling.cpu_frequency", "a positive integer"))?;
            config.profiling.cpu_frequency = hz as i32;
        }
        if let Some(v) = profiling.get("trace_interval_ms") {
            let ms = v
                .as_integer()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| invalid("profiling.trace_interval_ms", "a positive integer"))?;
            config.profiling.trace_interval_ms = ms as u64;
        }
    }

    if let Some(bind) = table.get("bind").and_then(|v| v.as_table()) {
        if let Some(v) = bind.get("host") {
            let v = v.as_str().ok_or_else(|| invalid("bind.host", "a string"))?;
            config.bind.host = v.to_string();
        }
        if let Some(v) = bind.get("http_port") {
            let port = v
                .as_integer()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| invalid("bind.http_port", "a port number"))?;
            config.bind.http_port = port;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level") {
            let v = v.as_str().ok_or_else(|| invalid("telemetry.log_level", "a string"))?;
            config.telemetry.log_level = v.to_string();
        }
    }

    Ok(())
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut BenchConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup; `apply_env_overrides` passes the process env.
pub fn apply_overrides_from<F>(config: &mut BenchConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("BENCHLOG_OUTPUT_DIR") {
        config.paths.output_dir = expand_path(&v);
        sources.env_overrides.push("BENCHLOG_OUTPUT_DIR".to_string());
    }
    if let Some(v) = lookup("BENCHLOG_ACCESS_LOG") {
        config.paths.access_log = expand_path(&v);
        sources.env_overrides.push("BENCHLOG_ACCESS_LOG".to_string());
    }

    if let Some(v) = lookup("BENCHLOG_MARKER_COMMAND") {
        config.marker.command = v;
        sources.env_overrides.push("BENCHLOG_MARKER_COMMAND".to_string());
    }
    if let Some(v) = lookup("BENCHLOG_MARKER_SHELL") {
        config.marker.shell = expand_path(&v);
        sources.env_overrides.push("BENCHLOG_MARKER_SHELL".to_string());
    }

    if let Some(v) = lookup("BENCHLOG_TRACE") {
        if let Some(enabled) = parse_bool(&v) {
            config.profiling.trace = enabled;
            sources.env_overrides.push("BENCHLOG_TRACE".to_string());
        }
    }
    if let Some(v) = lookup("BENCHLOG_BENCHMARK_SECS") {
        if let Ok(secs) = v.parse() {
            config.profiling.benchmark_secs = secs;
            sources.env_overrides.push("BENCHLOG_BENCHMARK_SECS".to_string());
        }
    }

    if let Some(v) = lookup("BENCHLOG_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.http_port = port;
            sources.env_overrides.push("BENCHLOG_HTTP_PORT".to_string());
        }
    }

    if let Some(v) = lookup("BENCHLOG_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("BENCHLOG_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins over everything
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
