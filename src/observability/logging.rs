//! Structured logging.

use crate::config::LoggingSettings;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Default directive when neither config nor environment set one.
const DEFAULT_FILTER: &str = "lakegraph=info,warn";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown log format '{other}' (options: pretty, json)"
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Event filter.
    pub filter: EnvFilter,
    /// Append events to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Builds logging configuration from config settings with env overrides.
    ///
    /// `LAKEGRAPH_LOG` wins over `RUST_LOG`, which wins over the configured
    /// filter. `verbose` raises the crate level to debug when no filter is
    /// set anywhere.
    #[must_use]
    pub fn from_settings(settings: Option<&LoggingSettings>, verbose: bool) -> Self {
        let mut format = settings
            .and_then(|s| s.format.as_deref())
            .and_then(|f| f.parse().ok())
            .unwrap_or_default();
        let mut file = settings.and_then(|s| s.file.as_ref()).map(PathBuf::from);

        if let Ok(val) = std::env::var("LAKEGRAPH_LOG_FORMAT")
            && let Ok(parsed) = val.parse()
        {
            format = parsed;
        }
        if let Some(path) = std::env::var_os("LAKEGRAPH_LOG_FILE") {
            file = Some(PathBuf::from(path));
        }

        let directive = std::env::var("LAKEGRAPH_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .or_else(|| settings.and_then(|s| s.filter.clone()))
            .unwrap_or_else(|| {
                if verbose {
                    "lakegraph=debug,info".to_string()
                } else {
                    DEFAULT_FILTER.to_string()
                }
            });
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
            // The subscriber is not installed yet
            #[allow(clippy::print_stderr)]
            {
                eprintln!("invalid log filter '{directive}': {e}");
            }
            EnvFilter::new(DEFAULT_FILTER)
        });

        Self {
            format,
            filter,
            file,
        }
    }
}
