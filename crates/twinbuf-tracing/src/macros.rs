//! Convenience macros for performance tracing

/// Create a performance span, optionally attaching fields.
///
/// ```rust
/// use twinbuf_tracing::perf_span;
///
/// {
///     let _span = perf_span!("device_fill", elements = 1024, tiles = 16);
///     // ... operation code ...
/// } // logs duration on drop
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a debug-level performance event.
///
/// ```rust
/// use twinbuf_tracing::perf_event;
///
/// perf_event!("mirror_allocated", elements = 1024, bytes = 4096);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_perf_span_macro() {
        let span = perf_span!("test_operation");
        assert_eq!(span.name(), "test_operation");
    }

    #[test]
    fn test_perf_span_with_fields() {
        let span = perf_span!("test_operation", size = 1024, count = 10);
        assert_eq!(span.name(), "test_operation");
    }

    #[test]
    fn test_perf_event_macro() {
        perf_event!("test_event", metric1 = 100, metric2 = "value");
    }
}
