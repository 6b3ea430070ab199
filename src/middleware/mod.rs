//! HTTP middleware. Request logging comes from `tracing_actix_web::TracingLogger`;
//! only metrics collection is implemented here.

pub mod metrics;

pub use metrics::MetricsMiddleware;
