//! Logging setup and metric helpers.
//!
//! Counters go through the `metrics` facade when the `metrics` feature is
//! enabled and compile to nothing otherwise; installing a recorder is left to
//! the embedding application.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Parse `AMQP2HTTP_LOG_FORMAT`; anything but `json` means text.
    pub fn from_env() -> Self {
        match std::env::var("AMQP2HTTP_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`. Calling this more than
/// once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_route(name: &'static str, route: &crate::types::RouteId) {
    metrics::increment_counter!(name, "route" => route.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_route(_name: &'static str, _route: &crate::types::RouteId) {}
