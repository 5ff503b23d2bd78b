use super::errors::RotationError;
use super::resource::ResourceName;
use crate::cert::Certificate;
use crate::error::ErrorKind;
use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tokio::sync::watch;

/// Lifecycle of one secret resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Registered; no producer has started yet.
    Uninitialized,
    /// Waiting for the first value; failures are retried silently.
    Acquiring,
    /// A value is installed and renewal is scheduled.
    Active,
    /// Renewal in progress; the installed value keeps being served.
    Renewing,
    /// Shut down.
    Closed,
}

/// Snapshot of a resource for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Current lifecycle state.
    pub state: ResourceState,
    /// Install generation; `0` until the first value lands.
    pub generation: u64,
    /// Expiry of the installed value.
    pub not_after: Option<OffsetDateTime>,
    /// Failed attempts since the last successful install.
    pub consecutive_failures: u32,
    /// Failed attempts since the resource was registered.
    pub total_failures: u64,
    /// Most recent failure, cleared on success.
    pub last_error: Option<String>,
    /// Category of the most recent failure.
    pub last_error_kind: Option<ErrorKind>,
}

/// An installed value together with its install generation.
///
/// The generation is the version served to SDS clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedCertificate {
    /// The installed value.
    pub certificate: Arc<Certificate>,
    /// Increments on every install.
    pub generation: u64,
}

/// What happened to a candidate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallOutcome {
    /// Installed under this generation.
    Installed(u64),
    /// Not strictly fresher than the installed value.
    NotFresher,
    /// Same root bundle as the installed value.
    Unchanged,
    /// A newer attempt already installed.
    Superseded,
}

/// How a slot decides whether a candidate replaces the installed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// Workload certificates move forward by expiry only.
    Expiry,
    /// Root bundles are replaced whenever their content changes, so a CA
    /// root rotation lands even if the new root expires earlier.
    Content,
}

impl Freshness {
    fn for_resource(name: &str) -> Self {
        match ResourceName::parse(name) {
            Some(ResourceName::Root | ResourceName::FileRoot(_)) => Freshness::Content,
            _ => Freshness::Expiry,
        }
    }
}

#[derive(Debug)]
struct InstallGuard {
    last_attempt: u64,
    generation: u64,
}

#[derive(Debug)]
struct StatusInner {
    state: ResourceState,
    consecutive_failures: u32,
    total_failures: u64,
    last_error: Option<(String, ErrorKind)>,
}

/// The single slot holding the current value of one named resource.
///
/// Reads are lock-free. Installs are serialized per slot and accepted only if
/// they come from an attempt at least as recent as the last install. Workload
/// values must also expire strictly later than the installed one; root
/// bundles must differ from it.
pub(crate) struct ResourceSlot {
    name: String,
    freshness: Freshness,
    current: ArcSwapOption<VersionedCertificate>,
    attempts: AtomicU64,
    install: Mutex<InstallGuard>,
    status: Mutex<StatusInner>,
    generation_tx: watch::Sender<u64>,
}

impl fmt::Debug for ResourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSlot")
            .field("name", &self.name)
            .field("generation", &*self.generation_tx.borrow())
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl ResourceSlot {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (generation_tx, _) = watch::channel(0);
        let name = name.into();
        Self {
            freshness: Freshness::for_resource(&name),
            name,
            current: ArcSwapOption::empty(),
            attempts: AtomicU64::new(0),
            install: Mutex::new(InstallGuard {
                last_attempt: 0,
                generation: 0,
            }),
            status: Mutex::new(StatusInner {
                state: ResourceState::Uninitialized,
                consecutive_failures: 0,
                total_failures: 0,
                last_error: None,
            }),
            generation_tx,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn current(&self) -> Option<Arc<VersionedCertificate>> {
        self.current.load_full()
    }

    pub(crate) fn certificate(&self) -> Option<Arc<Certificate>> {
        self.current
            .load()
            .as_ref()
            .map(|v| Arc::clone(&v.certificate))
    }

    /// Stamps a new attempt. Stamps increase monotonically.
    pub(crate) fn begin_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Installs `cert` if it replaces the current value and `attempt` has not
    /// been overtaken. Does not notify; see [`ResourceSlot::notify`].
    pub(crate) fn install(&self, cert: Arc<Certificate>, attempt: u64) -> InstallOutcome {
        let mut guard = self.install.lock().unwrap_or_else(PoisonError::into_inner);
        if attempt < guard.last_attempt {
            return InstallOutcome::Superseded;
        }
        if let Some(existing) = self.current.load().as_ref() {
            match self.freshness {
                Freshness::Expiry if !cert.is_fresher_than(&existing.certificate) => {
                    return InstallOutcome::NotFresher;
                }
                Freshness::Content
                    if cert.root_cert_pem() == existing.certificate.root_cert_pem() =>
                {
                    return InstallOutcome::Unchanged;
                }
                _ => {}
            }
        }
        guard.last_attempt = attempt;
        guard.generation += 1;
        let generation = guard.generation;
        self.current.store(Some(Arc::new(VersionedCertificate {
            certificate: cert,
            generation,
        })));
        drop(guard);

        let mut status = self.status();
        status.state = ResourceState::Active;
        status.consecutive_failures = 0;
        status.last_error = None;
        InstallOutcome::Installed(generation)
    }

    /// Wakes everyone waiting on this slot.
    pub(crate) fn notify(&self, generation: u64) {
        self.generation_tx.send_if_modified(|current| {
            if generation > *current {
                *current = generation;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        self.status().state = state;
    }

    /// Marks the start of an acquisition or renewal round.
    pub(crate) fn begin_round(&self) {
        let mut status = self.status();
        if status.state == ResourceState::Closed {
            return;
        }
        status.state = if self.current.load().is_some() {
            ResourceState::Renewing
        } else {
            ResourceState::Acquiring
        };
    }

    pub(crate) fn record_failure(&self, message: String, kind: ErrorKind) {
        let mut status = self.status();
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.total_failures = status.total_failures.saturating_add(1);
        status.last_error = Some((message, kind));
    }

    pub(crate) fn snapshot(&self) -> ResourceStatus {
        let current = self.current.load_full();
        let status = self.status();
        ResourceStatus {
            state: status.state,
            generation: current.as_ref().map_or(0, |v| v.generation),
            not_after: current.as_ref().map(|v| v.certificate.not_after()),
            consecutive_failures: status.consecutive_failures,
            total_failures: status.total_failures,
            last_error: status.last_error.as_ref().map(|(m, _)| m.clone()),
            last_error_kind: status.last_error.as_ref().map(|(_, k)| *k),
        }
    }

    pub(crate) fn updates(&self) -> ResourceUpdates {
        ResourceUpdates {
            rx: self.generation_tx.subscribe(),
        }
    }

    fn status(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for observing install generations of one resource.
///
/// Cloning yields another receiver on the same channel. Slow receivers may
/// skip intermediate generations.
#[derive(Clone, Debug)]
pub struct ResourceUpdates {
    rx: watch::Receiver<u64>,
}

impl ResourceUpdates {
    /// Waits for the next install and returns its generation.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Closed`] if the manager has been dropped.
    pub async fn changed(&mut self) -> Result<u64, RotationError> {
        self.rx.changed().await.map_err(|_| RotationError::Closed)?;
        Ok(*self.rx.borrow_and_update())
    }

    /// Returns the last generation without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the generation satisfies `f`.
    ///
    /// Returns immediately if the current generation already does.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Closed`] if the manager has been dropped.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, RotationError>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let generation = self.changed().await?;
            if f(&generation) {
                return Ok(generation);
            }
        }
    }
}
