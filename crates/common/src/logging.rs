use crate::config::{Environment, LogLevel};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber with pretty formatting for development
/// and JSON formatting for production.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn setup_logging(level: LogLevel, environment: Environment) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match environment {
        Environment::Production => registry
            .with(tracing_subscriber::fmt::layer().json().with_level(true))
            .try_init(),
        Environment::Development => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialised: {}", e);
    }
}
