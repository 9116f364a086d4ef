//! Tracing subscriber setup for host applications and the worker binary
//!
//! Output goes to stderr so a worker's stdout stays reserved for its reply.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TelemetryFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Install a global subscriber filtered by `RUST_LOG` (default `info`)
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(format: TelemetryFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        TelemetryFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        TelemetryFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        TelemetryFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    installed.is_ok()
}
