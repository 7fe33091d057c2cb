use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::utils::get_style_build;

/// Progress of one build, rendered as a bar on a `tracing` span.
///
/// The bar only shows up while the span is entered and an `IndicatifLayer`
/// is installed; the counters are tracked either way.
pub struct Progress {
    span: Span,
    length: AtomicU64,
    position: AtomicU64,
    stopped: AtomicBool,
}

impl Progress {
    pub fn new(message: &str) -> Self {
        let span = tracing::span!(Level::INFO, "compiling");
        span.pb_set_style(&get_style_build());
        span.pb_set_length(0);
        span.pb_set_message(message);

        Self {
            span,
            length: AtomicU64::new(0),
            position: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Grow the amount of expected work.
    pub fn append(&self, n: u64) {
        if self.is_stopped() {
            return;
        }
        let length = self.length.fetch_add(n, Ordering::SeqCst) + n;
        self.span.pb_set_length(length);
    }

    pub fn increment(&self) {
        if self.is_stopped() {
            return;
        }
        self.position.fetch_add(1, Ordering::SeqCst);
        self.span.pb_inc(1);
    }

    /// Freeze the bar, later ticks are ignored.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.span.pb_set_message("stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn length(&self) -> u64 {
        self.length.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_until_stopped() {
        let progress = Progress::new("test");
        progress.append(3);
        progress.append(1);
        progress.increment();
        progress.increment();

        assert_eq!(progress.length(), 4);
        assert_eq!(progress.position(), 2);

        progress.stop();
        progress.increment();
        progress.append(5);

        assert!(progress.is_stopped());
        assert_eq!(progress.position(), 2);
        assert_eq!(progress.length(), 4);
    }
}
