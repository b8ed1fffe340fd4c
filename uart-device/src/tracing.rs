//! Provide tracing, tailored to this crate.
//!
//! Programs built on the crate call one of the init_* functions at startup
//! to install a tracing subscriber. The library itself only emits events;
//! it never installs a subscriber on its own.
//!
//! Modules use `use crate::tracing::prelude::*` for the `trace!()`,
//! `debug!()`, `info!()`, `warn!()`, and `error!()` macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// Under systemd (detected through `JOURNAL_STREAM`) events go to journald;
/// otherwise, or if the journald socket is unusable, they go to stderr so
/// stdout stays free for port data.
pub fn init_journald_or_stderr() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(env_filter(LevelFilter::INFO))
                    .with(layer)
                    .init();
            }
            Err(e) => {
                use_stderr(LevelFilter::INFO);
                error!(error = %e, "Failed to initialize journald logging, using stderr.");
            }
        }
    } else {
        use_stderr(LevelFilter::INFO);
    }
}

/// Install a subscriber that writes through the test harness's captured
/// output. Safe to call from every test; only the first call installs.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(env_filter(LevelFilter::DEBUG))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// Filter according to RUST_LOG, falling back to the given level when the
// variable is unset or unparsable.
fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stderr(default: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(default))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(LocalTimer),
        )
        .init();
}

// Timestamps in local time to the millisecond; serial traffic is bursty
// enough that whole seconds hide the ordering.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
