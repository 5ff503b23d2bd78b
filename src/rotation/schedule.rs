//! Renewal timing.

use crate::cert::Certificate;
use std::time::Duration;
use time::OffsetDateTime;

/// Time until `cert` should be renewed.
///
/// Renewal starts once `grace_ratio` of the validity window remains, i.e. at
/// `not_after - grace_ratio * (not_after - not_before)`. A deadline in the past
/// yields `floor`, which also bounds every result from below so consecutive
/// renewals are paced.
pub fn renewal_delay(
    cert: &Certificate,
    grace_ratio: f64,
    now: OffsetDateTime,
    floor: Duration,
) -> Duration {
    let grace = cert.lifetime() * grace_ratio.clamp(0.0, 1.0);
    let renew_at = cert.not_after() - grace;
    Duration::try_from(renew_at - now)
        .unwrap_or(Duration::ZERO)
        .max(floor)
}
