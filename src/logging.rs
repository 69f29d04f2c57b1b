//! Tracing subscriber setup.
//!
//! Server events go to stderr, pretty by default or as JSON lines when
//! `json_logs` is set. `RUST_LOG` takes precedence over the configured level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::ServerConfig;

#[derive(Debug, Default)]
pub struct LogConfig {
    pub json: bool,
    /// `taskport=debug` instead of `taskport=info`
    pub verbose: bool,
}

impl From<&ServerConfig> for LogConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Install the global subscriber. Call once, after the config is loaded.
pub fn init(config: LogConfig) {
    let level = if config.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("taskport={level}")));

    if config.json {
        // connection and task spans are logged when they close
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

/// Lets at most one event through per interval. Task progress reports use it
/// to keep the debug log readable.
pub struct LogThrottle {
    interval_ms: u64,
    /// `u64::MAX` until the first event
    last_ms: AtomicU64,
    start: Instant,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(u64::MAX),
            start: Instant::now(),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != u64::MAX && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        // losing the race means another reporter just logged
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
