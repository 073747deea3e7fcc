//! Timing spans for kernel dispatches and training phases.
//!
//! ```rust
//! use tandem_tracing::performance::PerformanceSpan;
//!
//! {
//!     let _span = PerformanceSpan::new("forward", Some(100));
//!     // ... dispatch ...
//! } // logged only if it took at least 100us
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(true);
/// `u64::MAX` encodes "no global threshold".
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply the performance settings of an installed [`crate::TracingConfig`].
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently report anything.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match GLOBAL_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        value => Some(value),
    }
}

/// RAII guard that measures its own lifetime and logs it on drop.
///
/// The effective threshold is the larger of the per-span threshold and the
/// globally configured one.
#[derive(Debug)]
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(span_name: &str, threshold_us: Option<u64>) -> Self {
        Self::with_span(Self::enabled_span(|| tracing::debug_span!("perf", name = %span_name)), threshold_us)
    }

    /// Guard over a span built by the caller, usually through [`crate::perf_span!`].
    pub fn with_span(span: tracing::Span, threshold_us: Option<u64>) -> Self {
        let threshold_us = match (threshold_us, global_threshold()) {
            (Some(local), Some(global)) => Some(local.max(global)),
            (local, global) => local.or(global),
        };

        Self {
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    /// `make()` while performance spans are enabled, a disabled span otherwise.
    pub fn enabled_span(make: impl FnOnce() -> tracing::Span) -> tracing::Span {
        if is_enabled() {
            make()
        } else {
            tracing::Span::none()
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if self.span.is_none() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}
