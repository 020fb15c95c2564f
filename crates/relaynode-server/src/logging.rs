use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines (interactive use).
    Human,
    /// One JSON object per event (daemon mode, log shippers).
    Json,
}

impl LogFormat {
    pub fn from_str_arg(s: &str) -> Self {
        match s {
            "json" => LogFormat::Json,
            _ => LogFormat::Human,
        }
    }
}

/// Filter applied when `RUST_LOG` is unset: `level` for relaynode crates,
/// warnings for everything else.
pub fn default_filter(level: &str) -> String {
    format!("relaynode={},warn", level)
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init(format: LogFormat, level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_arg() {
        assert_eq!(LogFormat::from_str_arg("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_str_arg("human"), LogFormat::Human);
        assert_eq!(LogFormat::from_str_arg("other"), LogFormat::Human);
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter("debug"), "relaynode=debug,warn");
        assert!(EnvFilter::try_new(default_filter("info")).is_ok());
    }
}
