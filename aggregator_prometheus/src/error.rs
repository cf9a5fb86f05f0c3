use std::sync::atomic::{AtomicBool, Ordering};

use crate::debug::DEBUG;

/// Whether to log (verbose) error output.
/// Use the `ERROR_LOGGER` env var to override (on, off)
static ERROR_LOGGER: AtomicBool = AtomicBool::new(false);

pub fn debug_error_enabled(enabled: bool) {
    ERROR_LOGGER.store(enabled, Ordering::Relaxed);
}

pub fn debug_error(err: anyhow::Error) {
    if ERROR_LOGGER.load(Ordering::Relaxed) {
        tracing::warn!("{}", err);
        for err in err.chain().skip(1) {
            tracing::warn!("caused by: {}", err);
        }
    }
}

/// Receives the errors that an aggregation cycle recovers from.
///
/// Failing targets are left out of the merged result, so the reporter is the
/// only place where those failures become visible.
pub trait Reporter: Send + Sync {
    fn report(&self, err: anyhow::Error);
}

/// Counts the error and forwards it to [`debug_error`].
#[derive(Copy, Clone, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, err: anyhow::Error) {
        DEBUG.error_reported();
        debug_error(err);
    }
}

/// Discards every report.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _err: anyhow::Error) {}
}
