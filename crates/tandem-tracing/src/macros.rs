//! Instrumentation macros used by the device and the network engine.
//!
//! Both macros go through this crate's `tracing` re-export, so callers do
//! not need their own `tracing` dependency.

/// Time the enclosing scope with a [`crate::performance::PerformanceSpan`].
///
/// Extra fields are recorded on the span itself and show up on the
/// completion event.
///
/// ```rust
/// use tandem_tracing::perf_span;
///
/// {
///     let _span = perf_span!("dispatch", kernel = "forward", invocations = 4096);
///     // ... work ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {
        $crate::performance::PerformanceSpan::new($name, None)
    };
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        $crate::performance::PerformanceSpan::with_span(
            $crate::performance::PerformanceSpan::enabled_span(|| {
                $crate::__tracing::debug_span!("perf", name = $name, $($field = $value),+)
            }),
            None,
        )
    };
}

/// Debug-level event tagged with `event = $name`.
///
/// ```rust
/// use tandem_tracing::perf_event;
///
/// perf_event!("kernel_compiled", kernel = "forward", statements = 12);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        $crate::__tracing::debug!(event = $name, $($field = $value),+)
    };
}
