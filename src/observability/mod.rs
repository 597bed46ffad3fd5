//! Logging initialization.

use crate::config::LogFormat;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Default filter when neither `RUST_LOG` nor the config override is set.
const DEFAULT_FILTER: &str = "homegraph=info";

/// Initializes the global tracing subscriber. Idempotent; later calls are
/// no-ops so tests can call it freely.
pub fn init(format: LogFormat, filter: Option<&str>) {
    INIT.get_or_init(|| {
        let filter = filter.map_or_else(
            || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
            EnvFilter::new,
        );

        match format {
            LogFormat::Json => {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                    .try_init();
            },
            LogFormat::Pretty => {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .try_init();
            },
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(LogFormat::Pretty, Some("homegraph=debug"));
        init(LogFormat::Json, None);
    }
}
