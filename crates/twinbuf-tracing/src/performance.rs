//! Performance-focused tracing utilities
//!
//! Timed spans with threshold filtering, plus the standard events emitted for
//! allocations, host/device transfers and kernel launches.
//!
//! ## Example
//!
//! ```rust
//! use twinbuf_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("upload", Some(100));
//! // ... do work ...
//! drop(span); // logged only if it took at least 100μs
//!
//! record_transfer(4096, "H2D", 250);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static PERF_ENABLED: AtomicBool = AtomicBool::new(true);

// u64::MAX means "no global threshold".
static PERF_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply process-wide performance span settings.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    PERF_ENABLED.store(enabled, Ordering::Relaxed);
    PERF_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently emit anything.
pub fn is_enabled() -> bool {
    PERF_ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match PERF_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        threshold => Some(threshold),
    }
}

/// RAII guard that measures its own lifetime and logs it on drop.
///
/// Nothing is logged when performance tracing is disabled or when the elapsed
/// time is below the threshold. A span created without a threshold uses the
/// process-wide one set through [`configure`].
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a debug-level performance span.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Create a performance span at the given level.
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
            threshold_us: threshold_us.or_else(global_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since the span was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
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

fn per_second(amount: f64, duration_us: u64) -> f64 {
    if duration_us > 0 {
        amount / duration_us as f64 * 1_000_000.0
    } else {
        0.0
    }
}

/// Record a memory allocation in the given memory space ("device" or "host").
pub fn record_allocation(size_bytes: usize, space: &str, alignment: usize, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        space = space,
        alignment = alignment,
        duration_us = duration_us,
        "memory_allocation"
    );
}

/// Record a data transfer.
///
/// `direction` is one of `H2D`, `D2H` or `D2D`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = per_second(bytes as f64, duration_us) / (1024.0 * 1024.0);

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record a completed kernel launch over `elements` elements split into `tiles` tiles.
pub fn record_launch(kernel: &str, elements: usize, tiles: u64, duration_us: u64) {
    tracing::debug!(
        event = "launch",
        kernel = kernel,
        elements = elements,
        tiles = tiles,
        duration_us = duration_us,
        melems_per_sec = per_second(elements as f64, duration_us) / 1_000_000.0,
        "kernel_launch"
    );
}

/// Record element throughput of a host-side operation.
pub fn record_throughput(operation: &str, elements: usize, duration_us: u64) {
    tracing::debug!(
        event = "throughput",
        operation = operation,
        elements = elements,
        duration_us = duration_us,
        elements_per_sec = per_second(elements as f64, duration_us),
        "operation_throughput"
    );
}
