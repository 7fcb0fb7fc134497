//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! embedding process's choice. [`init_tracing`] is the default used by the
//! `test-cluster` binary: `RUST_LOG` filtering (default `info`) and either
//! compact or JSON lines on stderr.

use std::str::FromStr;
use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" | "jsonl" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. Only the first call has any effect, and
/// an already-installed subscriber is left in place.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let layer = match format {
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_filter(env_filter())
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .with_filter(env_filter())
                .boxed(),
        };
        // Fails only if another subscriber is already set, which is fine.
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}
