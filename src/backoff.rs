//! Retry pacing shared by the CA client, the rotation supervisor and the
//! control-plane connection helper.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Consecutive identical errors logged at WARN before dropping to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Smallest delay normalization allows; a zero delay never grows.
const MIN_BACKOFF_FLOOR: Duration = Duration::from_millis(1);

/// Backoff bounds for retried operations.
///
/// Delays start at `min_backoff`, double after every failure with up to 10%
/// jitter, and never exceed `max_backoff`. There is no attempt limit; retry
/// loops stop only on success, a permanent error, or cancellation.
///
/// If `min_backoff > max_backoff`, they are swapped on normalization. Both are
/// raised to at least 1ms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First delay after a failure.
    pub min_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ReconnectConfig {
    /// Returns a copy with `1ms <= min_backoff <= max_backoff`.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self.min_backoff = self.min_backoff.max(MIN_BACKOFF_FLOOR);
        self.max_backoff = self.max_backoff.max(self.min_backoff);
        self
    }
}

/// Allocation-free error categories for log de-duplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    /// CA rejected the credential.
    CaUnauthenticated,
    /// CA unreachable or overloaded.
    CaUnavailable,
    /// Token could not be read, fetched or exchanged.
    Token,
    /// A file-backed resource failed to load.
    FileLoad,
    /// Control-plane connection attempt failed.
    Connect,
}

/// Tracks repeated errors so steady failure does not flood the log.
///
/// The first [`MAX_CONSECUTIVE_SAME_ERROR`] occurrences of the same key are
/// reported as "warn"; later ones as "debug". A different key resets the run.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Records one occurrence; returns `true` if it should be logged at WARN.
    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

/// Sleeps for `dur`; returns `true` if cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Doubles `current`, clamps to `max`, then adds 0-10% jitter (still clamped).
///
/// Jitter is computed in whole milliseconds.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = cur.saturating_mul(2).min(max);
    if base == 0 {
        return Duration::ZERO;
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis(base.saturating_add(add).min(max))
}

/// Classifies errors for [`retry_with_backoff`].
pub(crate) trait Transient {
    /// `true` if the same operation may succeed when retried later.
    fn is_transient(&self) -> bool;
}

/// Why a retry loop stopped without a value.
#[derive(Debug)]
pub(crate) enum RetryStop<E> {
    Cancelled,
    Permanent(E),
}

/// Runs `op` until it succeeds, fails permanently, or `cancel` fires.
///
/// `on_retry` sees every transient failure together with the delay that
/// follows it. An in-flight attempt is dropped as soon as `cancel` fires.
pub(crate) async fn retry_with_backoff<T, E, Op, Fut, OnRetry>(
    reconnect: ReconnectConfig,
    cancel: &CancellationToken,
    mut op: Op,
    mut on_retry: OnRetry,
) -> Result<T, RetryStop<E>>
where
    E: Transient,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    OnRetry: FnMut(&E, Duration),
{
    let mut backoff = reconnect.min_backoff;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryStop::Cancelled);
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return Err(RetryStop::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryStop::Permanent(e)),
            Err(e) => {
                on_retry(&e, backoff);
                if sleep_or_cancel(cancel, backoff).await {
                    return Err(RetryStop::Cancelled);
                }
                backoff = next_backoff(backoff, reconnect.max_backoff);
            }
        }
    }
}
