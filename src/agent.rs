//! Agent facade tying rotation, secret discovery and credential selection together.

use crate::auth::{AuthTarget, Authenticator, CallCredential, ConnectError};
use crate::ca::CaClient;
use crate::config::CredentialConfig;
use crate::error::AgentError;
use crate::prelude::info;
use crate::rotation::{MetricsRecorder, RotationManager, VersionedCertificate};
use crate::sds::SdsServer;
use crate::source::CredentialSource;
use crate::token::{CredentialFetcher, TokenExchanger};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`Agent`].
///
/// # Example
///
/// ```no_run
/// use identity_agent::{Agent, CredentialConfig};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), identity_agent::AgentError> {
/// let config = CredentialConfig {
///     ca_endpoint: Some("https://istiod.istio-system.svc:15012".into()),
///     ca_root_cert: Some("/var/run/secrets/istio/root-cert.pem".into()),
///     jwt_path: Some("/var/run/secrets/tokens/istio-token".into()),
///     ..Default::default()
/// };
///
/// let agent = Agent::builder(config).build().await?;
/// agent.wait_ready(Duration::from_secs(30)).await?;
/// let sds = agent.sds();
/// # agent.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct AgentBuilder {
    config: CredentialConfig,
    ca_client: Option<Arc<dyn CaClient>>,
    credential_fetcher: Option<Arc<dyn CredentialFetcher>>,
    token_exchanger: Option<Arc<dyn TokenExchanger>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    sds_request_timeout: Option<Duration>,
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .field("ca_client", &self.ca_client.as_ref().map(|_| "<CaClient>"))
            .field(
                "credential_fetcher",
                &self
                    .credential_fetcher
                    .as_ref()
                    .map(|_| "<CredentialFetcher>"),
            )
            .field(
                "token_exchanger",
                &self.token_exchanger.as_ref().map(|_| "<TokenExchanger>"),
            )
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("sds_request_timeout", &self.sds_request_timeout)
            .finish()
    }
}

impl AgentBuilder {
    /// Creates a builder for `config`.
    pub fn new(config: CredentialConfig) -> Self {
        Self {
            config,
            ca_client: None,
            credential_fetcher: None,
            token_exchanger: None,
            metrics: None,
            sds_request_timeout: None,
        }
    }

    /// Uses `client` instead of a gRPC client built from the configuration.
    #[must_use]
    pub fn ca_client(mut self, client: Arc<dyn CaClient>) -> Self {
        self.ca_client = Some(client);
        self
    }

    /// Sources the platform token from `fetcher` instead of the JWT file.
    #[must_use]
    pub fn credential_fetcher(mut self, fetcher: Arc<dyn CredentialFetcher>) -> Self {
        self.credential_fetcher = Some(fetcher);
        self
    }

    /// Exchanges the platform token with `exchanger` before every CA attempt.
    #[must_use]
    pub fn token_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.token_exchanger = Some(exchanger);
        self
    }

    /// Records rotations, retries and errors to `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Overrides `sds_request_timeout` for the SDS server.
    #[must_use]
    pub fn sds_request_timeout(mut self, timeout: Duration) -> Self {
        self.sds_request_timeout = Some(timeout);
        self
    }

    /// Starts the rotation manager and the SDS server.
    ///
    /// # Errors
    ///
    /// See [`RotationManagerBuilder::build`](crate::rotation::RotationManagerBuilder::build).
    pub async fn build(self) -> Result<Agent, AgentError> {
        let mut builder = RotationManager::builder(self.config);
        if let Some(client) = self.ca_client {
            builder = builder.ca_client(client);
        }
        if let Some(fetcher) = self.credential_fetcher {
            builder = builder.credential_fetcher(fetcher);
        }
        if let Some(exchanger) = self.token_exchanger {
            builder = builder.token_exchanger(exchanger);
        }
        if let Some(metrics) = self.metrics {
            builder = builder.metrics(metrics);
        }
        let rotation = builder.build().await?;

        let sds = match self.sds_request_timeout {
            Some(timeout) => SdsServer::with_request_timeout(rotation.clone(), timeout),
            None => SdsServer::new(rotation.clone()),
        };
        info!(
            "Agent started: source={}, identity={}",
            rotation.source().as_str(),
            rotation.identity()
        );
        Ok(Agent { rotation, sds })
    }
}

/// A running identity agent.
///
/// Owns the [`RotationManager`] that keeps `default` and `ROOTCA` current, the
/// [`SdsServer`] handing them to the proxy, and the [`Authenticator`] that
/// picks credentials for control-plane connections.
#[derive(Debug, Clone)]
pub struct Agent {
    rotation: RotationManager,
    sds: SdsServer,
}

impl Agent {
    /// Returns a builder for `config`.
    pub fn builder(config: CredentialConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// Starts an agent with default collaborators.
    ///
    /// # Errors
    ///
    /// See [`AgentBuilder::build`].
    pub async fn start(config: CredentialConfig) -> Result<Self, AgentError> {
        AgentBuilder::new(config).build().await
    }

    /// Which credential source was resolved at startup.
    pub fn source(&self) -> &CredentialSource {
        self.rotation.source()
    }

    /// The rotation manager.
    pub fn rotation(&self) -> &RotationManager {
        &self.rotation
    }

    /// The SDS server.
    pub fn sds(&self) -> &SdsServer {
        &self.sds
    }

    /// The credential selector shared with the CA issuer.
    pub fn authenticator(&self) -> &Arc<Authenticator> {
        self.rotation.authenticator()
    }

    /// Selects the credential for a new control-plane connection.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Auth`] if no credential can be produced.
    pub async fn control_plane_credential(&self) -> Result<CallCredential, AgentError> {
        Ok(self
            .authenticator()
            .credential_for(AuthTarget::ControlPlane)
            .await?)
    }

    /// Connects to the control plane with `connect`, reselecting the
    /// credential and backing off whenever the attempt is rejected or the
    /// peer is unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Auth`] on a permanent failure or shutdown.
    pub async fn connect_control_plane<T, F, Fut>(&self, connect: F) -> Result<T, AgentError>
    where
        F: FnMut(CallCredential) -> Fut,
        Fut: Future<Output = Result<T, ConnectError>>,
    {
        let cancel = self.rotation.cancellation();
        Ok(self
            .authenticator()
            .with_credential_retry(
                AuthTarget::ControlPlane,
                self.rotation.config().reconnect,
                &cancel,
                connect,
            )
            .await?)
    }

    /// Waits up to `timeout` for the first workload certificate.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Rotation`] on timeout or shutdown.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<Arc<VersionedCertificate>, AgentError> {
        Ok(self.rotation.wait_ready(timeout).await?)
    }

    /// Stops background tasks within the configured shutdown timeout.
    ///
    /// Open SDS streams end with [`SdsError::Closed`](crate::sds::SdsError::Closed).
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Rotation`] if tasks had to be aborted.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        Ok(self.rotation.shutdown_configured().await?)
    }
}
