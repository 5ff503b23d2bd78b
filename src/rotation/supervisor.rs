//! Background producers: the CA issuer loop and file reload loops.

use super::errors::MetricsErrorKind;
use super::manager::Inner;
use super::schedule::renewal_delay;
use super::state::{InstallOutcome, ResourceSlot, ResourceState};
use crate::backoff::{
    next_backoff, sleep_or_cancel, ErrorKey, ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::ca::{request_with_retry, CaClient, CaError, CsrParams};
use crate::cert::load::{load_root, load_workload, LoadError};
use crate::cert::Certificate;
use crate::constants::WORKLOAD_RESOURCE;
use crate::error::ErrorKind;
use crate::prelude::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Upper bound between two reads of file-backed material.
pub(super) const FILE_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Files backing one resource.
#[derive(Debug, Clone)]
pub(super) enum FileMaterial {
    Cert {
        cert_chain: PathBuf,
        private_key: PathBuf,
        root_cert: Option<PathBuf>,
    },
    Root(PathBuf),
}

impl FileMaterial {
    pub(super) async fn load(&self, resource_name: &str) -> Result<Certificate, LoadError> {
        match self {
            FileMaterial::Cert {
                cert_chain,
                private_key,
                root_cert,
            } => {
                load_workload(
                    resource_name,
                    cert_chain,
                    private_key,
                    root_cert.as_deref(),
                    false,
                )
                .await
            }
            FileMaterial::Root(root_cert) => load_root(resource_name, root_cert).await,
        }
    }
}

/// Requests, installs and renews the workload certificate until cancelled.
pub(super) async fn run_issuer(
    inner: Arc<Inner>,
    ca: Arc<dyn CaClient>,
    workload: Arc<ResourceSlot>,
    root: Arc<ResourceSlot>,
) {
    let reconnect = inner.config.reconnect;
    info!(
        "Certificate issuer started: identity={}, source={}",
        inner.identity,
        inner.authenticator.source().as_str()
    );

    let params = CsrParams::new(inner.identity.clone(), inner.config.cert_ttl)
        .with_key_algorithm(inner.config.key_algorithm);

    // Grows while the CA keeps returning results that are not fresher, so a
    // CA capping notAfter is not asked again on every floor tick.
    let mut discard_backoff = reconnect.min_backoff;

    loop {
        workload.begin_round();
        let attempt = workload.begin_attempt();

        let result = request_with_retry(
            ca.as_ref(),
            &inner.authenticator,
            &params,
            reconnect,
            &inner.cancel,
            |err, _delay| {
                workload.record_failure(err.to_string(), err.kind());
                inner.record_error(MetricsErrorKind::for_ca(err));
                inner.record_retry();
            },
        )
        .await
        .and_then(|issued| {
            issued.into_certificate(WORKLOAD_RESOURCE, inner.fallback_root.as_deref())
        });

        let discarded = match result {
            Ok(cert) => !matches!(
                inner
                    .install_workload(&workload, &root, cert, attempt, true)
                    .await,
                InstallOutcome::Installed(_)
            ),
            Err(CaError::Cancelled) => break,
            Err(e) => {
                error!(
                    "Certificate request failed permanently; retrying in {}ms: error={}",
                    reconnect.max_backoff.as_millis(),
                    e
                );
                workload.record_failure(e.to_string(), e.kind());
                inner.record_error(MetricsErrorKind::for_ca(&e));
                if workload.current().is_some() {
                    workload.set_state(ResourceState::Active);
                }
                if sleep_or_cancel(&inner.cancel, reconnect.max_backoff).await {
                    break;
                }
                continue;
            }
        };

        let mut delay = workload.certificate().map_or(reconnect.min_backoff, |cert| {
            renewal_delay(
                &cert,
                inner.config.grace_ratio,
                OffsetDateTime::now_utc(),
                reconnect.min_backoff,
            )
        });
        if discarded {
            delay = delay.max(discard_backoff);
            discard_backoff = next_backoff(discard_backoff, reconnect.max_backoff);
        } else {
            discard_backoff = reconnect.min_backoff;
        }
        debug!(
            "Next workload certificate renewal scheduled: delay_ms={}",
            delay.as_millis()
        );
        if sleep_or_cancel(&inner.cancel, delay).await {
            break;
        }
    }

    workload.set_state(ResourceState::Closed);
    root.set_state(ResourceState::Closed);
    debug!("Certificate issuer stopped");
}

/// Re-reads file-backed material on the grace schedule and installs it
/// whenever it replaces the installed value: a later expiry for certificates,
/// different content for root bundles.
///
/// Files are only ever read. Load failures back off and retry.
pub(super) async fn run_file_reload(
    inner: Arc<Inner>,
    slot: Arc<ResourceSlot>,
    material: FileMaterial,
) {
    let reconnect = inner.config.reconnect;
    let mut backoff = reconnect.min_backoff;
    let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

    loop {
        slot.begin_round();
        let attempt = slot.begin_attempt();

        let delay = match material.load(slot.name()).await {
            Ok(cert) => {
                if tracker.consecutive_count() > 0 {
                    info!(
                        "File-backed resource recovered after {} consecutive failures: resource={}",
                        tracker.consecutive_count(),
                        slot.name()
                    );
                }
                tracker.reset();
                backoff = reconnect.min_backoff;

                if let InstallOutcome::Installed(_generation) =
                    inner.install(&slot, Arc::new(cert), attempt)
                {
                    debug!(
                        "Loaded file-backed resource: resource={}, generation={}",
                        slot.name(),
                        _generation
                    );
                }
                slot.certificate()
                    .map_or(FILE_RELOAD_INTERVAL, |cert| {
                        renewal_delay(
                            &cert,
                            inner.config.grace_ratio,
                            OffsetDateTime::now_utc(),
                            reconnect.max_backoff,
                        )
                    })
                    .min(FILE_RELOAD_INTERVAL)
            }
            Err(e) => {
                if tracker.record_error(ErrorKey::FileLoad) {
                    warn!(
                        "Failed to load file-backed resource; retrying: resource={}, error={}, backoff_ms={}",
                        slot.name(),
                        e,
                        backoff.as_millis()
                    );
                } else {
                    debug!(
                        "Failed to load file-backed resource (repeated); retrying: resource={}, error={}, consecutive_failures={}",
                        slot.name(),
                        e,
                        tracker.consecutive_count()
                    );
                }
                slot.record_failure(e.to_string(), ErrorKind::Invalid);
                if slot.current().is_some() {
                    slot.set_state(ResourceState::Active);
                }
                inner.record_error(MetricsErrorKind::FileLoad);
                inner.record_retry();
                let delay = backoff;
                backoff = next_backoff(backoff, reconnect.max_backoff);
                delay
            }
        };

        if sleep_or_cancel(&inner.cancel, delay).await {
            break;
        }
    }

    slot.set_state(ResourceState::Closed);
}
