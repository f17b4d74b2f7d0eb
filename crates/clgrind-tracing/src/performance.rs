//! Timing guards and structured records for simulator performance events.
//!
//! ```rust
//! use clgrind_tracing::performance::{record_work_group, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("work_group", Some(100));
//! drop(span);
//! record_work_group(0, 64, 1_024, 150);
//! ```

use std::time::Instant;
use tracing::Level;

/// RAII guard that logs its lifetime on drop, subject to a threshold.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start a debug-level span. `threshold_us = None` always logs.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Start a span at an explicit level.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold_us(&self) -> Option<u64> {
        self.threshold_us
    }

    /// Microseconds since the span started.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the underlying tracing span.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
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

fn per_second(count: u64, duration_us: u64) -> f64 {
    if duration_us == 0 {
        0.0
    } else {
        count as f64 * 1_000_000.0 / duration_us as f64
    }
}

/// Record a finished kernel invocation.
pub fn record_kernel_invocation(kernel: &str, groups: u64, work_items: u64, workers: usize, duration_us: u64) {
    tracing::debug!(
        event = "kernel_invocation",
        kernel = kernel,
        groups = groups,
        work_items = work_items,
        workers = workers,
        duration_us = duration_us,
        work_items_per_sec = per_second(work_items, duration_us),
        "kernel_invocation_complete"
    );
}

/// Record a finished work-group.
pub fn record_work_group(group_index: usize, work_items: usize, instructions: u64, duration_us: u64) {
    tracing::trace!(
        event = "work_group",
        group_index = group_index,
        work_items = work_items,
        instructions = instructions,
        duration_us = duration_us,
        instructions_per_sec = per_second(instructions, duration_us),
        "work_group_complete"
    );
}

/// Record a buffer allocation in one of the simulated address spaces.
pub fn record_allocation(space: &str, size_bytes: u64, buffer: u64) {
    tracing::trace!(
        event = "allocation",
        space = space,
        size_bytes = size_bytes,
        buffer = buffer,
        "memory_allocation"
    );
}

/// Record that a diagnostic reached the bus sink.
pub fn record_diagnostic(kind: &str, suppressed: bool) {
    tracing::debug!(event = "diagnostic", kind = kind, suppressed = suppressed, "diagnostic_logged");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_remembers_name_and_threshold() {
        let span = PerformanceSpan::new("group", Some(1000));
        assert_eq!(span.name(), "group");
        assert_eq!(span.threshold_us(), Some(1000));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::with_level(Level::INFO, "sleep", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn throughput_handles_zero_duration() {
        assert_eq!(per_second(100, 0), 0.0);
        assert!((per_second(1_000, 1_000) - 1_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn records_do_not_panic() {
        record_kernel_invocation("vecadd", 4, 64, 2, 120);
        record_work_group(1, 16, 512, 40);
        record_allocation("global", 4096, 3);
        record_diagnostic("data-race", false);
    }
}
