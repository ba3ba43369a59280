//! Tracing initialisation for the prcov binary.
//!
//! Every log line goes to stderr. Stdout is reserved for command output
//! (`prcov resolve` associations, `prcov run --output -` JSON), so it can be
//! piped without filtering. ANSI colours are only used when stderr is a
//! terminal, which keeps CI job logs free of escape codes.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` - emit newline-delimited JSON instead of human-readable lines.
/// * `level` - default verbosity when `RUST_LOG` is unset.
///
/// Only the first call in a process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(!json && std::io::stderr().is_terminal());

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(layer.json()).try_init().ok();
    } else {
        registry.with(layer).try_init().ok();
    }
}
