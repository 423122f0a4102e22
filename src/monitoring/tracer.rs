/*!
 * Tracing
 * Structured logging setup and timed operation spans using the tracing crate
 */

use std::time::Instant;
use tracing::{info, span, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Environment variable switching the output to JSON
pub const TRACE_JSON_ENV: &str = "ASH_TRACE_JSON";

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - ASH_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns false if a global subscriber was already installed, in which case
/// the existing one is left in place.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(TRACE_JSON_ENV)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
    installed
}

/// Timed span around one stress or maintenance operation
///
/// Logs its duration and outcome when dropped.
pub struct OperationSpan {
    span: Span,
    start: Instant,
    passed: Option<bool>,
}

impl OperationSpan {
    pub fn new(operation: &str) -> Self {
        let span = span!(
            Level::INFO,
            "operation",
            operation = operation,
            items = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            passed: None,
        }
    }

    /// Number of items (writes, reads, allocations) the operation handled
    pub fn record_items(&self, items: u64) {
        self.span.record("items", items);
    }

    pub fn record_result(&mut self, passed: bool) {
        self.passed = Some(passed);
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationSpan {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        let elapsed = self.start.elapsed();
        match self.passed {
            Some(true) | None => info!(
                duration_ms = elapsed.as_millis() as u64,
                "operation completed"
            ),
            Some(false) => tracing::error!(
                duration_ms = elapsed.as_millis() as u64,
                "operation failed"
            ),
        }
    }
}

/// Helper to create an operation span
#[inline]
pub fn span_operation(name: &str) -> OperationSpan {
    OperationSpan::new(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test_tracing() {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new("debug"))
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init();
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_test_tracing();
        assert!(!init_tracing());
    }

    #[test]
    fn test_operation_span() {
        init_test_tracing();

        let mut span = span_operation("test_op");
        span.record_items(42);
        span.record_result(true);
        let _guard = span.span().enter();
        // Span will be dropped and logged with structured fields
    }
}
