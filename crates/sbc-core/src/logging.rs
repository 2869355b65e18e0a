//! Subscriber installation for binaries and tests embedding the SBC

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;

use crate::error::{Result, SbcError};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to enable JSON formatting
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log spans
    pub log_spans: bool,
    /// Application name to include in logs
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "sbc".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable JSON formatting
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Enable file and line information in logs
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Enable span logging
    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Logs the startup banner under the application name
    pub fn welcome(&self) {
        log_welcome(&self.app_name, env!("CARGO_PKG_VERSION"));
    }
}

/// The `[logging]` table of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
    pub log_spans: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: "info".to_string(),
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingSection {
    pub fn to_logging_config(&self, app_name: &str) -> Result<LoggingConfig> {
        Ok(LoggingConfig {
            level: parse_log_level(&self.level)?,
            json: self.json,
            file_info: self.file_info,
            log_spans: self.log_spans,
            app_name: app_name.to_string(),
        })
    }
}

/// Installs the global subscriber and logs the startup banner.
///
/// `RUST_LOG` directives are honoured on top of the configured level. Fails
/// when a global subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };

    installed.map_err(|e| SbcError::Config(format!("Failed to install logging: {}", e)))?;
    config.welcome();
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| SbcError::Config(format!("Invalid log level: {}", level)))
}

/// Log a welcome message with version info
pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{}", app_name, version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(parse_log_level("loud"), Err(SbcError::Config(_))));
    }

    #[test]
    fn section_converts_to_config() {
        let section = LoggingSection { level: "trace".into(), json: true, ..Default::default() };
        let config = section.to_logging_config("edge").unwrap();
        assert_eq!(config.level, Level::TRACE);
        assert!(config.json);
        assert_eq!(config.app_name, "edge");
    }

    #[test]
    fn welcome_names_the_application() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = fmt::Subscriber::builder()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            LoggingConfig::new(Level::INFO, "edge-sbc").welcome();
        });
        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains(&format!("Starting edge-sbc v{}", env!("CARGO_PKG_VERSION"))));
    }

    #[test]
    #[serial]
    fn second_install_is_an_error() {
        let config = LoggingConfig::new(Level::WARN, "test").with_file_info();
        // Another test binary may already own the global subscriber
        let _ = setup_logging(&config);
        assert!(setup_logging(&config).is_err());
    }
}
