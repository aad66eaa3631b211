//! Configuration for the devlens binaries: TOML file + `DEVLENS_*`
//! environment overrides, with defaults for everything and validation up
//! front. A bad config is an exit-code-2 problem, not a runtime surprise.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use devlens_core::runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    /// Listen address for the HTTP/WebSocket surface.
    pub bind: String,
    #[serde(with = "devlens_core::duration")]
    pub heartbeat_ms: u64,
    /// Client silence beyond this closes the connection.
    #[serde(with = "devlens_core::duration")]
    pub idle_close_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9470".to_string(),
            heartbeat_ms: 30_000,
            idle_close_ms: 60_000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|err| invalid("server.bind", format!("{err}")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DevlensConfig {
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
    /// tracing-subscriber EnvFilter directive, e.g. `info,devlens_core=debug`.
    pub log_filter: String,
}

impl DevlensConfig {
    /// Load from an optional TOML file, then apply environment overrides
    /// and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // A .env next to the binary is honored but never required.
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::Io { path: path.to_path_buf(), source }
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: Box::new(source),
                })?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        debug!(?path, "configuration loaded");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("DEVLENS_STORAGE_PATH") {
            self.runtime.storage.path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("DEVLENS_WATCH_ROOT") {
            self.runtime
                .file_monitor
                .get_or_insert_with(Default::default)
                .root = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("DEVLENS_GIT_REPO") {
            self.runtime
                .git_monitor
                .get_or_insert_with(Default::default)
                .repo_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("DEVLENS_BIND") {
            self.server.bind = value;
        }
        if let Ok(value) = std::env::var("DEVLENS_LOG") {
            self.log_filter = value;
        }
        if self.log_filter.is_empty() {
            self.log_filter = "info".to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let runtime = &self.runtime;
        if runtime.storage.retention_days == 0 {
            return Err(invalid("storage.retention_days", "must be at least 1"));
        }
        if let Some(max_bytes) = runtime.storage.max_bytes
            && max_bytes < 1024 * 1024
        {
            return Err(invalid(
                "storage.max_bytes",
                "below 1 MiB the store cannot hold its own schema",
            ));
        }
        let threshold = runtime.stage_analyzer.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "stage_analyzer.confidence_threshold",
                "must be within 0..=1",
            ));
        }
        if runtime.stage_analyzer.window_ms == 0 {
            return Err(invalid("stage_analyzer.window_ms", "must be non-zero"));
        }
        for (name, queue) in [
            ("default", &runtime.queues.default),
            ("priority", &runtime.queues.priority),
            ("batch", &runtime.queues.batch),
            ("failed", &runtime.queues.failed),
        ] {
            if queue.max_size == 0 {
                return Err(invalid(
                    &format!("queues.{name}.max_size"),
                    "must be non-zero",
                ));
            }
            if queue.batch_size == 0 {
                return Err(invalid(
                    &format!("queues.{name}.batch_size"),
                    "must be non-zero",
                ));
            }
            if queue.max_attempts == 0 {
                return Err(invalid(
                    &format!("queues.{name}.max_attempts"),
                    "must be at least 1",
                ));
            }
        }
        if runtime.queues.max_queues < 4 {
            return Err(invalid(
                "queues.max_queues",
                "the four reserved queues always exist",
            ));
        }
        if runtime.ai.seconds_saved_per_line < 0.0 {
            return Err(invalid(
                "ai.seconds_saved_per_line",
                "must be non-negative",
            ));
        }
        if runtime.stream.buffer_size == 0 {
            return Err(invalid("stream.buffer_size", "must be non-zero"));
        }
        if let Some(file_monitor) = &runtime.file_monitor
            && file_monitor.debounce_ms == 0
        {
            return Err(invalid("file_monitor.debounce_ms", "must be non-zero"));
        }
        if let Some(git_monitor) = &runtime.git_monitor
            && git_monitor.poll_interval_ms < 100
        {
            return Err(invalid(
                "git_monitor.poll_interval_ms",
                "polling below 100ms thrashes the repository",
            ));
        }
        self.server.bind_addr().map(|_| ())
    }

    /// Render the effective configuration back to TOML (for `status` and
    /// debugging).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = DevlensConfig::default();
        let mut config = config;
        config.apply_env();
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn toml_sections_land_in_the_right_places() {
        let raw = r#"
            log_filter = "debug"

            [storage]
            path = "/tmp/devlens-test.db"
            retention_days = 7

            [queues]
            auto_routing = false

            [queues.default]
            max_size = 64
            batch_size = 8

            [file_monitor]
            root = "/workspace/project"
            debounce_ms = 100

            [stage_analyzer]
            confidence_threshold = 0.6
            transition_cooldown_ms = "30s"

            [server]
            bind = "127.0.0.1:9999"
            heartbeat_ms = "15s"
        "#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let config = DevlensConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.runtime.storage.path,
            PathBuf::from("/tmp/devlens-test.db")
        );
        assert_eq!(config.runtime.storage.retention_days, 7);
        assert!(!config.runtime.queues.auto_routing);
        assert_eq!(config.runtime.queues.default.max_size, 64);
        assert_eq!(config.runtime.queues.default.batch_size, 8);
        let file_monitor = config.runtime.file_monitor.as_ref().unwrap();
        assert_eq!(file_monitor.root, PathBuf::from("/workspace/project"));
        assert_eq!(file_monitor.debounce_ms, 100);
        assert_eq!(config.runtime.stage_analyzer.confidence_threshold, 0.6);
        // Duration fields take either integer milliseconds or humantime
        // strings.
        assert_eq!(config.runtime.stage_analyzer.transition_cooldown_ms, 30_000);
        assert_eq!(config.server.bind, "127.0.0.1:9999");
        assert_eq!(config.server.heartbeat_ms, 15_000);
    }

    #[test]
    fn unparseable_duration_string_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[git_monitor]\npoll_interval_ms = \"whenever\"\n")
            .unwrap();
        let err = DevlensConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = DevlensConfig::default();
        config.runtime.stage_analyzer.confidence_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn zero_sized_queue_is_rejected() {
        let mut config = DevlensConfig::default();
        config.runtime.queues.batch.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let mut config = DevlensConfig::default();
        config.server.bind = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unparseable_toml_reports_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is { not toml").unwrap();
        let err = DevlensConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
