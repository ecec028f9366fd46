//! Tracing subscriber setup.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "tiffster_engine=info,tiffster_storage=info,info";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset
    pub default_filter: String,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            default_filter: DEFAULT_FILTER.to_string(),
            service_name: "tiffster-worker".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// # Environment Variables
    /// - `TIFFSTER_LOG_FORMAT`: `json` for JSON lines, anything else for
    ///   human-readable output (default: pretty)
    /// - `TIFFSTER_SERVICE_NAME`: Name logged at startup (default: tiffster-worker)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            format: std::env::var("TIFFSTER_LOG_FORMAT")
                .map(|s| {
                    if s.eq_ignore_ascii_case("json") {
                        LogFormat::Json
                    } else {
                        LogFormat::Pretty
                    }
                })
                .unwrap_or(defaults.format),
            service_name: std::env::var("TIFFSTER_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            default_filter: defaults.default_filter,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Filter directives come from `RUST_LOG`, falling back to
/// `config.default_filter`. Fails if a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }

    tracing::info!(
        service_name = %config.service_name,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}
