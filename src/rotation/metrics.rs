use super::errors::MetricsErrorKind;

/// Hook for recording rotation metrics.
///
/// Implement this trait to integrate with your metrics system (e.g., Prometheus, `StatsD`).
/// Labels passed in are stable and low-cardinality.
///
/// # Example
///
/// ```no_run
/// use identity_agent::rotation::{MetricsErrorKind, MetricsRecorder};
///
/// struct MyMetrics;
///
/// impl MetricsRecorder for MyMetrics {
///     fn record_rotation(&self, resource: &str) {
///         println!("rotated {resource}");
///     }
///
///     fn record_retry(&self) {}
///
///     fn record_error(&self, kind: MetricsErrorKind) {
///         println!("error: {}", kind.as_str());
///     }
/// }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records that a new value was installed for `resource`.
    fn record_rotation(&self, resource: &str);

    /// Records that a failed attempt is about to be retried after a backoff.
    fn record_retry(&self);

    /// Records an error with a structured kind.
    fn record_error(&self, kind: MetricsErrorKind);
}
