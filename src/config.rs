//! Adapter wide configuration.

use crate::session::args::ChildSessions;
use crate::{muted_error, weak_error};
use log::error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file content, every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Default interpreter for launch requests.
    pub perl: String,
    /// Default port for attach requests.
    pub attach_port: u16,
    /// Timeout of `runInTerminal` and `startDebugging` requests.
    pub reverse_request_timeout_ms: u64,
    /// Default model for additional debuggee processes.
    pub child_sessions: ChildSessions,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            perl: "perl".to_string(),
            attach_port: 5000,
            reverse_request_timeout_ms: 30_000,
            child_sessions: ChildSessions::default(),
        }
    }
}

impl AdapterConfig {
    const DEFAULT_PATH: &'static str = ".config/perl-dap/config.toml";

    pub fn default_path() -> Option<PathBuf> {
        Some(home::home_dir()?.join(Self::DEFAULT_PATH))
    }

    /// Load configuration from file, the default path is used if `path` is [`None`].
    /// Return defaults on errors.
    pub fn from_file(path: Option<&Path>) -> Self {
        let data = match path {
            None => {
                let Some(path) = Self::default_path() else {
                    return Self::default();
                };
                match muted_error!(read_to_string(path)) {
                    Some(data) => data,
                    None => return Self::default(),
                }
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    error!(target: "dap", "Error while load config file {}: {err}", path.display());
                    return Self::default();
                }
            },
        };

        weak_error!(Self::from_toml(&data), "malformed config file:").unwrap_or_default()
    }

    pub fn from_toml(data: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(data)
    }

    pub fn reverse_request_timeout(&self) -> Duration {
        Duration::from_millis(self.reverse_request_timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config = AdapterConfig::from_toml(
            r#"
            perl = "/opt/perl/bin/perl"
            child_sessions = "threads"
            "#,
        )
        .unwrap();

        assert_eq!(config.perl, "/opt/perl/bin/perl");
        assert_eq!(config.child_sessions, ChildSessions::Threads);
        assert_eq!(config.attach_port, 5000);
        assert_eq!(config.reverse_request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_config() {
        assert!(AdapterConfig::from_toml("attach_port = \"x\"").is_err());

        let path = std::env::temp_dir().join(format!("perl-dap-config-{}.toml", std::process::id()));
        std::fs::write(&path, "attach_port = [").unwrap();
        assert_eq!(AdapterConfig::from_file(Some(&path)), AdapterConfig::default());
        std::fs::remove_file(path).unwrap();
    }
}
