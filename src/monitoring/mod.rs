/*!
 * Monitoring
 * Structured logging for the pool and the stress driver
 */

mod tracer;

pub use tracer::{init_tracing, span_operation, OperationSpan, TRACE_JSON_ENV};
