use crate::prelude::{debug, info, warn};
use crate::rotation::{RotationError, RotationManager};
use crate::sds::error::SdsError;
use crate::sds::types::{version_info, SdsRequest, SdsResponse, SecretResource};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAM_BUFFER: usize = 16;

/// Counters kept per stream and, aggregated, per server.
#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    responses: AtomicU64,
    pushes: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SdsStats {
        SdsStats {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of request and response counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdsStats {
    /// Requests received.
    pub requests: u64,
    /// Responses sent, pushes included.
    pub responses: u64,
    /// Responses triggered by a rotation rather than a request.
    pub pushes: u64,
    /// Acknowledged responses.
    pub acks: u64,
    /// Rejected responses.
    pub nacks: u64,
}

/// Serves workload secrets to a local proxy.
///
/// Transport-agnostic: requests arrive as any [`Stream`] of [`SdsRequest`] and
/// responses leave through an [`SdsStream`]. Every stream reads the same
/// [`RotationManager`], so all of them observe the same swapped value.
///
/// Cloning shares the manager and the counters.
#[derive(Clone)]
pub struct SdsServer {
    manager: RotationManager,
    request_timeout: Duration,
    nonce: Arc<AtomicU64>,
    stream_ids: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl Debug for SdsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdsServer")
            .field("manager", &self.manager)
            .field("request_timeout", &self.request_timeout)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl SdsServer {
    /// Creates a server reading from `manager`, using the configured
    /// `sds_request_timeout` as the initial wait for unseen resources.
    pub fn new(manager: RotationManager) -> Self {
        let request_timeout = manager.config().sds_request_timeout;
        Self::with_request_timeout(manager, request_timeout)
    }

    /// Creates a server with an explicit initial wait.
    pub fn with_request_timeout(manager: RotationManager, request_timeout: Duration) -> Self {
        Self {
            manager,
            request_timeout,
            nonce: Arc::new(AtomicU64::new(0)),
            stream_ids: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// The manager this server reads from.
    pub fn manager(&self) -> &RotationManager {
        &self.manager
    }

    /// Aggregated counters of every stream and fetch.
    pub fn stats(&self) -> SdsStats {
        self.counters.snapshot()
    }

    /// Answers a single request.
    ///
    /// Waits up to the request timeout for resources without a value.
    ///
    /// # Errors
    ///
    /// - [`SdsError::EmptyRequest`] if no names are given.
    /// - [`SdsError::UnknownResource`] for an unrecognized name.
    /// - [`SdsError::Closed`] after shutdown.
    pub async fn fetch_secrets(&self, request: SdsRequest) -> Result<SdsResponse, SdsError> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let names = request.unique_names();
        if names.is_empty() {
            return Err(SdsError::EmptyRequest);
        }
        for name in &names {
            self.manager.ensure_resource(name).map_err(|e| match e {
                RotationError::UnknownResource(name) => SdsError::UnknownResource(name),
                _ => SdsError::Closed,
            })?;
        }
        self.await_initial(&names, "fetch").await?;
        let response = self.build_response(&names);
        self.counters.responses.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }

    /// Opens a secret stream driven by `requests`.
    ///
    /// The first request subscribes to its resource names and is answered
    /// once every name has a value or the request timeout passed; installs of
    /// subscribed resources during that wait are pushed right away. After
    /// that, every install of a subscribed resource pushes a fresh response. A
    /// request echoing the last nonce acknowledges (or, with `error_detail`,
    /// rejects) that response; pushes continue either way. A request naming
    /// a different set re-subscribes.
    ///
    /// The stream ends when `requests` ends, the receiver is dropped, or the
    /// manager shuts down (after a final [`SdsError::Closed`]).
    pub fn stream_secrets<S>(&self, requests: S) -> SdsStream
    where
        S: Stream<Item = SdsRequest> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let stream_counters = Arc::new(Counters::default());
        let id = self.stream_ids.fetch_add(1, Ordering::Relaxed) + 1;

        let session = StreamSession {
            server: self.clone(),
            counters: Arc::clone(&stream_counters),
            id,
            subscribed: Vec::new(),
            sent: HashMap::new(),
            last_nonce: None,
            answered: false,
        };
        tokio::spawn(session.run(Box::pin(requests), tx));

        SdsStream {
            id,
            inner: ReceiverStream::new(rx),
            counters: stream_counters,
        }
    }

    fn next_nonce(&self) -> String {
        format!("{:x}", self.nonce.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Builds a response from the current values of `names`; absent names are omitted.
    fn build_response(&self, names: &[String]) -> SdsResponse {
        let resources: Vec<SecretResource> = names
            .iter()
            .filter_map(|name| {
                self.manager.versioned(name).map(|v| SecretResource {
                    name: name.clone(),
                    version: v.generation,
                    certificate: Arc::clone(&v.certificate),
                })
            })
            .collect();
        SdsResponse {
            version_info: version_info(&resources),
            nonce: self.next_nonce(),
            resources,
        }
    }

    /// Waits for every name without a value. Only shutdown is an error.
    async fn await_initial(&self, names: &[String], context: &str) -> Result<(), SdsError> {
        let waits = names
            .iter()
            .filter(|name| self.manager.versioned(name).is_none())
            .map(|name| async move {
                (
                    name,
                    self.manager.wait_for(name, self.request_timeout).await,
                )
            });
        for (name, result) in futures::future::join_all(waits).await {
            match result {
                Ok(_) => {}
                Err(RotationError::Closed) => return Err(SdsError::Closed),
                Err(e) => {
                    warn!(
                        "Secret not available, omitting from response: context={}, resource={}, error={}",
                        context, name, e
                    );
                }
            }
        }
        Ok(())
    }
}

/// Responses of one secret stream.
///
/// Implements [`Stream`]; dropping it ends the stream.
#[derive(Debug)]
pub struct SdsStream {
    id: u64,
    inner: ReceiverStream<Result<SdsResponse, SdsError>>,
    counters: Arc<Counters>,
}

impl SdsStream {
    /// Server-assigned stream identifier, as used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Counters of this stream only.
    pub fn stats(&self) -> SdsStats {
        self.counters.snapshot()
    }
}

impl Stream for SdsStream {
    type Item = Result<SdsResponse, SdsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct StreamSession {
    server: SdsServer,
    counters: Arc<Counters>,
    id: u64,
    subscribed: Vec<String>,
    sent: HashMap<String, u64>,
    last_nonce: Option<String>,
    answered: bool,
}

type Sender = mpsc::Sender<Result<SdsResponse, SdsError>>;

/// Wait for the first values of a new subscription.
type InitialWait = Pin<Box<dyn Future<Output = Result<(), SdsError>> + Send>>;

/// What the session loop does after a request.
enum Step {
    Continue,
    Stop,
    /// The subscribed set changed and needs an answer.
    Subscribed,
}

async fn wait_initial(pending: &mut Option<InitialWait>) -> Result<(), SdsError> {
    match pending {
        Some(wait) => wait.await,
        None => std::future::pending().await,
    }
}

impl StreamSession {
    async fn run(
        mut self,
        mut requests: Pin<Box<dyn Stream<Item = SdsRequest> + Send>>,
        tx: Sender,
    ) {
        let cancel = self.server.manager.cancellation();
        let mut events = self.server.manager.subscribe();
        // Runs alongside the other branches so a slow resource never holds
        // back pushes or shutdown.
        let mut pending: Option<InitialWait> = None;
        info!("SDS stream opened: stream={}", self.id);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = tx.send(Err(SdsError::Closed)).await;
                    break;
                }
                () = tx.closed() => {
                    debug!("SDS receiver dropped: stream={}", self.id);
                    break;
                }
                request = requests.next() => {
                    let Some(request) = request else {
                        debug!("SDS request stream ended: stream={}", self.id);
                        break;
                    };
                    match self.handle_request(request, &tx).await {
                        Step::Continue => {}
                        Step::Stop => break,
                        Step::Subscribed => {
                            self.answered = false;
                            pending = Some(self.initial_wait());
                        }
                    }
                }
                result = wait_initial(&mut pending), if pending.is_some() => {
                    pending = None;
                    if let Err(e) = result {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    let answer = !self.answered || self.has_unsent_versions();
                    if answer && !self.respond(&tx, false).await {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        let stale = self.subscribed.contains(&event.name)
                            && self.sent.get(&event.name) != Some(&event.generation);
                        if stale && !self.push(&tx).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "SDS stream lagged behind rotations, resending: stream={}, skipped={}",
                            self.id, skipped
                        );
                        if self.has_unsent_versions() && !self.push(&tx).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("SDS stream closed: stream={}", self.id);
    }

    fn initial_wait(&self) -> InitialWait {
        let server = self.server.clone();
        let names = self.subscribed.clone();
        Box::pin(async move { server.await_initial(&names, "stream").await })
    }

    async fn handle_request(&mut self, request: SdsRequest, tx: &Sender) -> Step {
        self.bump(|c| &c.requests);

        let answers_last = !request.response_nonce.is_empty()
            && self.last_nonce.as_deref() == Some(request.response_nonce.as_str());
        if answers_last {
            match &request.error_detail {
                Some(detail) => {
                    self.bump(|c| &c.nacks);
                    warn!(
                        "SDS response rejected: stream={}, nonce={}, node={}, detail={}",
                        self.id,
                        request.response_nonce,
                        request.node_id.as_deref().unwrap_or("-"),
                        detail
                    );
                }
                None => {
                    self.bump(|c| &c.acks);
                    debug!(
                        "SDS response acknowledged: stream={}, nonce={}, version={}",
                        self.id, request.response_nonce, request.version_info
                    );
                }
            }
        } else if !request.response_nonce.is_empty() {
            debug!(
                "SDS request with stale nonce: stream={}, nonce={}",
                self.id, request.response_nonce
            );
        }

        let names = request.unique_names();
        if !request.response_nonce.is_empty() && names == self.subscribed {
            return Step::Continue;
        }
        if names.is_empty() {
            self.subscribed.clear();
            debug!("SDS stream unsubscribed from all resources: stream={}", self.id);
            return Step::Continue;
        }

        for name in &names {
            if let Err(e) = self.server.manager.ensure_resource(name) {
                if matches!(e, RotationError::Closed) {
                    let _ = tx.send(Err(SdsError::Closed)).await;
                    return Step::Stop;
                }
                warn!(
                    "Ignoring requested secret: stream={}, resource={}, error={}",
                    self.id, name, e
                );
            }
        }
        debug!(
            "SDS stream subscribed: stream={}, resources={:?}",
            self.id, names
        );
        self.subscribed = names;
        Step::Subscribed
    }

    async fn push(&mut self, tx: &Sender) -> bool {
        self.respond(tx, true).await
    }

    async fn respond(&mut self, tx: &Sender, pushed: bool) -> bool {
        let response = self.server.build_response(&self.subscribed);
        for resource in &response.resources {
            self.sent.insert(resource.name.clone(), resource.version);
        }
        self.last_nonce = Some(response.nonce.clone());
        self.answered = true;

        debug!(
            "Sending SDS response: stream={}, version={}, nonce={}, pushed={}",
            self.id, response.version_info, response.nonce, pushed
        );
        self.bump(|c| &c.responses);
        if pushed {
            self.bump(|c| &c.pushes);
        }
        tx.send(Ok(response)).await.is_ok()
    }

    fn has_unsent_versions(&self) -> bool {
        self.subscribed.iter().any(|name| {
            self.server
                .manager
                .versioned(name)
                .is_some_and(|v| self.sent.get(name) != Some(&v.generation))
        })
    }

    fn bump(&self, counter: impl Fn(&Counters) -> &AtomicU64) {
        counter(&self.counters).fetch_add(1, Ordering::Relaxed);
        counter(&self.server.counters).fetch_add(1, Ordering::Relaxed);
    }
}
