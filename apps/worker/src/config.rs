use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: std::io::Error },
    #[error("Failed to write config file {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: std::io::Error },
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("Could not determine a config directory (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub scheduler: SchedulerSettings,
    pub probes: ProbeSettings,
    pub retention: RetentionSettings,
    pub logging: LoggingSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
    pub max_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often the job set is re-read from the database
    pub reconcile_interval_secs: u64,
    /// Granularity of the due-job check
    pub tick_interval_ms: u64,
    pub max_concurrent_probes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub dns_timeout_secs: u64,
    pub tls_timeout_secs: u64,
    pub tls_port: u16,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

/// Zero disables the corresponding pruning; history is kept forever by default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub probe_run_days: u32,
    pub resolved_incident_days: u32,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `compact` or `json`; unset falls back to `RUST_LOG_FORMAT`
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub channels: Vec<NotificationChannel>,
}

/// Where an incident notification is addressed, e.g. `email` + an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub channel: String,
    pub destination: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { path: "obsdns.db".into(), max_connections: 8 }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { reconcile_interval_secs: 60, tick_interval_ms: 1000, max_concurrent_probes: 10 }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            dns_timeout_secs: 5,
            tls_timeout_secs: 10,
            tls_port: 443,
            http_timeout_secs: 10,
            user_agent: "ObservabilityDNS/1.0".into(),
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self { probe_run_days: 0, resolved_incident_days: 0, cleanup_interval_secs: 3600 }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".into(), format: None }
    }
}

impl SchedulerSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }
}

impl ProbeSettings {
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn tls_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/obsdns/worker.toml or
/// $HOME/.config/...)
pub fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("obsdns/worker.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let write_2 = write_indented(2);

        writeln!(f, "Current Worker Configuration:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_1(f, "Max Connections", &self.database.max_connections)?;

        write_title_1(f, "Scheduler")?;
        write_1(f, "Reconcile Interval (s)", &self.scheduler.reconcile_interval_secs)?;
        write_1(f, "Tick Interval (ms)", &self.scheduler.tick_interval_ms)?;
        write_1(f, "Max Concurrent Probes", &self.scheduler.max_concurrent_probes)?;

        write_title_1(f, "Probes")?;
        write_1(f, "DNS Timeout (s)", &self.probes.dns_timeout_secs)?;
        write_1(f, "TLS Timeout (s)", &self.probes.tls_timeout_secs)?;
        write_1(f, "TLS Port", &self.probes.tls_port)?;
        write_1(f, "HTTP Timeout (s)", &self.probes.http_timeout_secs)?;
        write_1(f, "User Agent", &self.probes.user_agent)?;

        write_title_1(f, "Retention")?;
        write_1(f, "Probe Runs (days)", &self.retention.probe_run_days)?;
        write_1(f, "Resolved Incidents (days)", &self.retention.resolved_incident_days)?;
        write_1(f, "Cleanup Interval (s)", &self.retention.cleanup_interval_secs)?;

        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;
        write_1(f, "Format", &self.logging.format.as_deref().unwrap_or("default"))?;

        write_title_1(f, "Notifications")?;
        if self.notifications.channels.is_empty() {
            write_1(f, "Channels", &"none")?;
        }
        for channel in &self.notifications.channels {
            write_2(f, &channel.channel, &channel.destination)?;
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/obsdns/worker.toml
    /// or the specified path if one does not exist
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| Error::ReadFailed { path: config_path.clone(), source })?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.reconcile_interval(), Duration::from_secs(60));
        assert_eq!(config.scheduler.max_concurrent_probes, 10);
        assert_eq!(config.probes.dns_timeout(), Duration::from_secs(5));
        assert_eq!(config.probes.tls_timeout(), Duration::from_secs(10));
        assert_eq!(config.probes.http_timeout(), Duration::from_secs(10));
        assert_eq!(config.probes.tls_port, 443);
        assert_eq!(config.retention.probe_run_days, 0);
        assert_eq!(config.retention.resolved_incident_days, 0);
        assert!(config.notifications.channels.is_empty());
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/worker.toml");

        let config = Config::from_config(Some(&path)).unwrap();

        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::from_config(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        fs::write(
            &path,
            r#"
[scheduler]
max_concurrent_probes = 4

[[notifications.channels]]
channel = "email"
destination = "ops@example.com"
"#,
        )
        .unwrap();

        let config = Config::from_config(Some(&path)).unwrap();

        assert_eq!(config.scheduler.max_concurrent_probes, 4);
        assert_eq!(config.scheduler.reconcile_interval_secs, 60);
        assert_eq!(config.probes, ProbeSettings::default());
        assert_eq!(config.notifications.channels[0].destination, "ops@example.com");
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        fs::write(&path, "[scheduler\nmax = ").unwrap();

        assert!(matches!(Config::from_config(Some(&path)), Err(Error::ParseFailed(_))));
    }

    #[test]
    fn test_extension_is_forced_to_toml() {
        assert_eq!(normalize_toml_path(path::Path::new("/tmp/worker.conf")), path::PathBuf::from("/tmp/worker.toml"));
        assert_eq!(normalize_toml_path(path::Path::new("/tmp/worker")), path::PathBuf::from("/tmp/worker.toml"));
    }

    #[test]
    fn test_display_lists_channels() {
        let mut config = Config::default();
        config.notifications.channels.push(NotificationChannel {
            channel: "slack".into(),
            destination: "#alerts".into(),
        });

        let rendered = config.to_string();
        assert!(rendered.contains("Max Concurrent Probes: 10"));
        assert!(rendered.contains("slack: #alerts"));
    }
}
