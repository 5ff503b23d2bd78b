use super::builder::RotationManagerBuilder;
use super::disk::DiskWriter;
use super::errors::{MetricsErrorKind, RotationError};
use super::metrics::MetricsRecorder;
use super::resource::ResourceName;
use super::state::{
    InstallOutcome, ResourceSlot, ResourceState, ResourceStatus, ResourceUpdates,
    VersionedCertificate,
};
use super::supervisor::{run_file_reload, FileMaterial};
use crate::auth::Authenticator;
use crate::ca::CaClient;
use crate::cert::Certificate;
use crate::config::CredentialConfig;
use crate::constants::{ROOT_RESOURCE, WORKLOAD_RESOURCE};
use crate::identity::SpiffeId;
use crate::prelude::{debug, info, warn};
use crate::source::CredentialSource;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

const EVENT_CAPACITY: usize = 64;

/// Notification that a resource was installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    /// Resource name.
    pub name: String,
    /// New install generation.
    pub generation: u64,
}

/// Owns the current certificate of every secret resource and keeps it fresh.
///
/// The workload certificate (`default`) and its root bundle (`ROOTCA`) are
/// produced by one background task; file-backed resources each get their own
/// reload task. Renewal failures are retried with backoff and never surface
/// to readers, who keep seeing the previously installed value.
///
/// Handles are cheap to clone. Background tasks stop when the last handle is
/// dropped or on [`RotationManager::shutdown`].
#[derive(Clone)]
pub struct RotationManager {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

pub(super) struct Inner {
    pub(super) config: CredentialConfig,
    pub(super) identity: SpiffeId,
    pub(super) authenticator: Arc<Authenticator>,
    pub(super) fallback_root: Option<Vec<u8>>,
    pub(super) metrics: Option<Arc<dyn MetricsRecorder>>,
    pub(super) disk: Option<DiskWriter>,
    pub(super) cancel: CancellationToken,

    slots: Mutex<HashMap<String, Arc<ResourceSlot>>>,
    events: broadcast::Sender<ResourceEvent>,

    closed: AtomicBool,
    shutdown_timeout: Option<Duration>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationManager")
            .field("identity", &self.identity)
            .field("source", self.authenticator.source())
            .field("grace_ratio", &self.config.grace_ratio)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("output_dir", &self.disk.as_ref().map(DiskWriter::dir))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for RotationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl Inner {
    pub(super) fn slot(&self, name: &str) -> Arc<ResourceSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(ResourceSlot::new(name))),
        )
    }

    fn existing_slot(&self, name: &str) -> Option<Arc<ResourceSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registers `name`; returns the slot and whether it was new.
    fn register(&self, name: &str) -> (Arc<ResourceSlot>, bool) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(name) {
            return (Arc::clone(slot), false);
        }
        let slot = Arc::new(ResourceSlot::new(name));
        slots.insert(name.to_owned(), Arc::clone(&slot));
        (slot, true)
    }

    pub(super) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn close_slots(&self) {
        for slot in self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            slot.set_state(ResourceState::Closed);
        }
    }

    pub(super) fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(metrics) = self.metrics.as_deref() {
            metrics.record_error(kind);
        }
    }

    pub(super) fn record_retry(&self) {
        if let Some(metrics) = self.metrics.as_deref() {
            metrics.record_retry();
        }
    }

    /// Installs `cert` into `slot` and notifies subscribers on success.
    pub(super) fn install(
        &self,
        slot: &ResourceSlot,
        cert: Arc<Certificate>,
        attempt: u64,
    ) -> InstallOutcome {
        let outcome = slot.install(cert, attempt);
        match outcome {
            InstallOutcome::Installed(generation) => self.announce(slot, generation),
            InstallOutcome::NotFresher | InstallOutcome::Superseded | InstallOutcome::Unchanged => {
                if slot.current().is_some() {
                    slot.set_state(ResourceState::Active);
                }
            }
        }
        outcome
    }

    /// Installs a new workload certificate and the root bundle it carries.
    ///
    /// The certificate is mirrored to disk before anyone is notified. The root
    /// bundle is installed whenever its content changed, even if the workload
    /// certificate was not fresher, unless a newer attempt already landed.
    pub(super) async fn install_workload(
        &self,
        workload: &ResourceSlot,
        root: &ResourceSlot,
        cert: Certificate,
        attempt: u64,
        issued: bool,
    ) -> InstallOutcome {
        let cert = Arc::new(cert);
        let outcome = workload.install(Arc::clone(&cert), attempt);
        match outcome {
            InstallOutcome::Installed(generation) => {
                if let Some(disk) = &self.disk {
                    if let Err(_e) = disk.write(&cert).await {
                        warn!(
                            "Failed to write certificate files: dir={}, error={}",
                            disk.dir().display(),
                            _e
                        );
                        self.record_error(MetricsErrorKind::DiskWrite);
                    }
                }
                if issued {
                    self.authenticator.publish_issued(Arc::clone(&cert));
                }
                self.announce(workload, generation);
                info!(
                    "Installed workload certificate: resource={}, generation={}, not_after={}",
                    workload.name(),
                    generation,
                    cert.not_after()
                );
            }
            InstallOutcome::NotFresher | InstallOutcome::Superseded | InstallOutcome::Unchanged => {
                debug!(
                    "Discarded certificate not fresher than the installed one: resource={}, outcome={:?}",
                    workload.name(),
                    outcome
                );
                self.record_error(MetricsErrorKind::StaleResult);
                workload.set_state(ResourceState::Active);
            }
        }

        if outcome == InstallOutcome::Superseded {
            return outcome;
        }
        match cert.root_resource(root.name()) {
            Ok(Some(root_cert)) => {
                let root_attempt = root.begin_attempt();
                self.install(root, Arc::new(root_cert), root_attempt);
            }
            Ok(None) => {}
            Err(_e) => warn!(
                "Root bundle attached to workload certificate is invalid: error={}",
                _e
            ),
        }
        outcome
    }

    fn announce(&self, slot: &ResourceSlot, generation: u64) {
        if let Some(metrics) = self.metrics.as_deref() {
            metrics.record_rotation(slot.name());
        }
        slot.notify(generation);
        let _ = self.events.send(ResourceEvent {
            name: slot.name().to_owned(),
            generation,
        });
    }
}

impl RotationManager {
    /// Creates a builder for `config`.
    pub fn builder(config: CredentialConfig) -> RotationManagerBuilder {
        RotationManagerBuilder::new(config)
    }

    pub(super) fn from_parts(
        config: CredentialConfig,
        identity: SpiffeId,
        authenticator: Arc<Authenticator>,
        fallback_root: Option<Vec<u8>>,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let disk = config.output_dir.clone().map(DiskWriter::new);
        let shutdown_timeout = config.shutdown_timeout;
        let inner = Arc::new(Inner {
            config,
            identity,
            authenticator,
            fallback_root,
            metrics,
            disk,
            cancel: cancel.clone(),
            slots: Mutex::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
            shutdown_timeout,
            tasks: Mutex::new(Vec::new()),
        });
        Self {
            inner,
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    pub(super) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Starts the task producing `default` and `ROOTCA` from the CA.
    pub(super) fn start_issuer(&self, ca: Arc<dyn CaClient>) {
        let workload = self.inner.slot(WORKLOAD_RESOURCE);
        let root = self.inner.slot(ROOT_RESOURCE);
        workload.set_state(ResourceState::Acquiring);
        root.set_state(ResourceState::Acquiring);
        let inner = Arc::clone(&self.inner);
        self.inner
            .spawn(super::supervisor::run_issuer(inner, ca, workload, root));
    }

    /// Starts a reload task for an already registered file-backed slot.
    pub(super) fn start_file_reload(&self, slot: Arc<ResourceSlot>, material: FileMaterial) {
        let inner = Arc::clone(&self.inner);
        self.inner.spawn(run_file_reload(inner, slot, material));
    }

    /// The resolved credential source.
    pub fn source(&self) -> &CredentialSource {
        self.inner.authenticator.source()
    }

    /// The credential selector shared with the CA client.
    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.inner.authenticator
    }

    /// The normalized configuration.
    pub fn config(&self) -> &CredentialConfig {
        &self.inner.config
    }

    /// The identity requested from the CA.
    pub fn identity(&self) -> &SpiffeId {
        &self.inner.identity
    }

    /// Returns the installed value of `name`, if any.
    pub fn certificate(&self, name: &str) -> Option<Arc<Certificate>> {
        self.inner.existing_slot(name)?.certificate()
    }

    /// Returns the installed value of `name` with its generation.
    pub fn versioned(&self, name: &str) -> Option<Arc<VersionedCertificate>> {
        self.inner.existing_slot(name)?.current()
    }

    /// Returns a status snapshot of `name`, or `None` if it was never requested.
    pub fn status(&self, name: &str) -> Option<ResourceStatus> {
        self.inner.existing_slot(name).map(|slot| slot.snapshot())
    }

    /// Returns a handle for observing installs of `name`.
    pub fn resource_updates(&self, name: &str) -> Option<ResourceUpdates> {
        self.inner.existing_slot(name).map(|slot| slot.updates())
    }

    /// Subscribes to install events of every resource.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.inner.events.subscribe()
    }

    /// Makes sure a producer exists for `name`.
    ///
    /// `default` and `ROOTCA` are produced from startup. `file-cert:` and
    /// `file-root:` names start a file reload task on first request.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::UnknownResource`] for unrecognized names and
    /// [`RotationError::Closed`] after shutdown.
    pub fn ensure_resource(&self, name: &str) -> Result<(), RotationError> {
        if self.is_closed() {
            return Err(RotationError::Closed);
        }
        let parsed = ResourceName::parse(name)
            .ok_or_else(|| RotationError::UnknownResource(name.to_owned()))?;
        let material = match parsed {
            ResourceName::Workload | ResourceName::Root => {
                self.inner.slot(name);
                return Ok(());
            }
            ResourceName::FileCert {
                cert_chain,
                private_key,
            } => FileMaterial::Cert {
                cert_chain,
                private_key,
                root_cert: None,
            },
            ResourceName::FileRoot(root_cert) => FileMaterial::Root(root_cert),
        };
        let (slot, created) = self.inner.register(name);
        if created {
            debug!("Starting file-backed resource: resource={}", name);
            slot.set_state(ResourceState::Acquiring);
            self.start_file_reload(slot, material);
        }
        Ok(())
    }

    /// Waits up to `timeout` for `name` to have a value.
    ///
    /// # Errors
    ///
    /// - [`RotationError::Timeout`] if no value arrives in time.
    /// - [`RotationError::Closed`] if the manager shuts down while waiting.
    /// - [`RotationError::UnknownResource`] for unrecognized names.
    pub async fn wait_for(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Arc<VersionedCertificate>, RotationError> {
        self.ensure_resource(name)?;
        let slot = self.inner.slot(name);
        if let Some(current) = slot.current() {
            return Ok(current);
        }

        let mut updates = slot.updates();
        let wait = async {
            updates.wait_for(|generation| *generation > 0).await?;
            slot.current().ok_or(RotationError::Closed)
        };
        tokio::select! {
            () = self.inner.cancel.cancelled() => Err(RotationError::Closed),
            result = tokio::time::timeout(timeout, wait) => match result {
                Ok(value) => value,
                Err(_) => Err(RotationError::Timeout {
                    resource: name.to_owned(),
                    timeout,
                }),
            },
        }
    }

    /// Waits up to `timeout` for the workload certificate.
    ///
    /// # Errors
    ///
    /// See [`RotationManager::wait_for`].
    pub async fn wait_ready(
        &self,
        timeout: Duration,
    ) -> Result<Arc<VersionedCertificate>, RotationError> {
        self.wait_for(WORKLOAD_RESOURCE, timeout).await
    }

    /// Returns `true` once shutdown has started.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Cancels background tasks and waits for them to finish.
    ///
    /// Idempotent. May wait indefinitely if a task does not respond; prefer
    /// [`RotationManager::shutdown_with_timeout`] or
    /// [`RotationManager::shutdown_configured`].
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        for handle in self.inner.take_tasks() {
            if let Err(_e) = handle.await {
                warn!("Error joining rotation task during shutdown: error={}", _e);
                self.inner
                    .record_error(MetricsErrorKind::SupervisorJoinFailed);
            }
        }
        self.inner.close_slots();
    }

    /// Cancels background tasks and waits up to `timeout`, then aborts them.
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::ShutdownTimeout`] if tasks had to be aborted.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), RotationError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let mut handles = self.inner.take_tasks();
        let joined =
            tokio::time::timeout(timeout, futures::future::join_all(handles.iter_mut())).await;
        let result = match joined {
            Ok(results) => {
                for _e in results.into_iter().filter_map(Result::err) {
                    warn!("Error joining rotation task during shutdown: error={}", _e);
                    self.inner
                        .record_error(MetricsErrorKind::SupervisorJoinFailed);
                }
                Ok(())
            }
            Err(_) => {
                warn!("Shutdown timeout exceeded; aborting rotation tasks");
                for handle in &handles {
                    handle.abort();
                }
                for handle in handles {
                    let _ = handle.await;
                }
                Err(RotationError::ShutdownTimeout)
            }
        };
        self.inner.close_slots();
        result
    }

    /// Shuts down using the configured `shutdown_timeout`, or waits
    /// indefinitely if none is set.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::ShutdownTimeout`] if the timeout is exceeded.
    pub async fn shutdown_configured(&self) -> Result<(), RotationError> {
        if let Some(timeout) = self.inner.shutdown_timeout {
            self.shutdown_with_timeout(timeout).await
        } else {
            self.shutdown().await;
            Ok(())
        }
    }
}
