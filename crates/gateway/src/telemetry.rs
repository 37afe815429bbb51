//! Tracing subscriber installation.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::LogFormat, error::GatewayError};

/// Filter used when `RUST_LOG` is unset or unparseable.
pub const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber: an `EnvFilter` from `RUST_LOG` (falling
/// back to [`DEFAULT_FILTER`]) and a formatter in the requested format.
///
/// # Errors
///
/// Returns [`GatewayError::Telemetry`] if a global subscriber is already set.
pub fn init(format: LogFormat) -> Result<(), GatewayError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init()?,
        LogFormat::Json => {
            let layer = fmt::layer().json().with_current_span(true).with_target(true);
            registry.with(layer).try_init()?;
        },
    }
    Ok(())
}
