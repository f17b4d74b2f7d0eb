//! Span macro for invocation and work-group timing.

/// Time a region of the simulator, optionally tagging it with fields.
///
/// Expands to a [`crate::performance::PerformanceSpan`] guard that logs its
/// duration on drop. With fields, a `perf` debug span carrying them is
/// entered for the guard's statement.
///
/// ```rust
/// use clgrind_tracing::perf_span;
///
/// let _span = perf_span!("work_group", group = 3, items = 64);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _fields = tracing::debug_span!("perf", name = $name, $($field = $value),+).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_span_without_threshold() {
        let span = perf_span!("kernel_invocation");
        assert_eq!(span.threshold_us(), None);
    }

    #[test]
    fn test_span_with_group_fields() {
        let span = perf_span!("work_group", group = 7, items = 16, worker = 0);
        assert!(span.elapsed_us() < 60_000_000);
    }
}
