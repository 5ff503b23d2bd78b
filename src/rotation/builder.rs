use super::errors::RotationError;
use super::manager::RotationManager;
use super::metrics::MetricsRecorder;
use super::state::ResourceState;
use super::supervisor::FileMaterial;
use crate::auth::Authenticator;
use crate::ca::{CaClient, GrpcCaClient};
use crate::cert::load::read_file;
use crate::config::{ConfigError, CredentialConfig};
use crate::constants::{ROOT_RESOURCE, WORKLOAD_RESOURCE};
use crate::prelude::info;
use crate::source::{resolve, CredentialSource};
use crate::token::{CredentialFetcher, TokenExchanger, TokenProvider};
use std::fmt;
use std::sync::Arc;

/// Builder for [`RotationManager`].
///
/// Collaborators that are not set fall back to defaults: a gRPC CA client
/// built from the configuration, the JWT file as the only token source, and
/// no metrics.
///
/// # Example
///
/// ```no_run
/// use identity_agent::rotation::RotationManager;
/// use identity_agent::CredentialConfig;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = CredentialConfig {
///     ca_endpoint: Some("http://127.0.0.1:15010".into()),
///     jwt_path: Some("/var/run/secrets/tokens/istio-token".into()),
///     initial_fetch_timeout: Some(Duration::from_secs(30)),
///     ..Default::default()
/// };
/// let manager = RotationManager::builder(config).build().await?;
/// let cert = manager.certificate("default");
/// # Ok(())
/// # }
/// ```
pub struct RotationManagerBuilder {
    config: CredentialConfig,
    ca_client: Option<Arc<dyn CaClient>>,
    credential_fetcher: Option<Arc<dyn CredentialFetcher>>,
    token_exchanger: Option<Arc<dyn TokenExchanger>>,
    authenticator: Option<Arc<Authenticator>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl fmt::Debug for RotationManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationManagerBuilder")
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
            .field("authenticator", &self.authenticator)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl RotationManagerBuilder {
    /// Creates a builder for `config`.
    pub fn new(config: CredentialConfig) -> Self {
        Self {
            config,
            ca_client: None,
            credential_fetcher: None,
            token_exchanger: None,
            authenticator: None,
            metrics: None,
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

    /// Shares an existing credential selector. Token sources set on this
    /// builder are ignored when one is given.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Arc<Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Records rotations, retries and errors to `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration, loads file-backed material or starts the
    /// CA issuer, and waits for the first workload certificate if
    /// `initial_fetch_timeout` is set.
    ///
    /// # Errors
    ///
    /// - [`RotationError::Config`] for invalid configuration.
    /// - [`RotationError::Load`] if mounted certificate files cannot be loaded.
    /// - [`RotationError::Timeout`] if the first certificate does not arrive
    ///   within `initial_fetch_timeout`.
    pub async fn build(self) -> Result<RotationManager, RotationError> {
        let config = self.config.normalized();
        config.validate()?;
        let identity = config.workload_identity()?;

        let authenticator = match self.authenticator {
            Some(authenticator) => authenticator,
            None => {
                let mut tokens = TokenProvider::new(config.jwt_path.clone());
                if let Some(fetcher) = self.credential_fetcher {
                    tokens = tokens.with_fetcher(fetcher);
                }
                if let Some(exchanger) = self.token_exchanger {
                    tokens = tokens.with_exchanger(exchanger);
                }
                Arc::new(Authenticator::new(resolve(&config), tokens))
            }
        };
        let source = authenticator.source().clone();

        let ca_client: Option<Arc<dyn CaClient>> = match self.ca_client {
            _ if !source.requires_ca() => None,
            Some(client) => Some(client),
            None => Some(Arc::new(GrpcCaClient::from_config(&config).await?)),
        };

        let fallback_root = match &config.ca_root_cert {
            Some(path) if source.requires_ca() => Some(read_file(path).await.map_err(|e| {
                ConfigError::UnreadableCaRoot {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?),
            _ => None,
        };

        let initial_fetch_timeout = config.initial_fetch_timeout;
        let manager = RotationManager::from_parts(
            config,
            identity,
            authenticator,
            fallback_root,
            self.metrics,
        );

        info!(
            "Starting rotation manager: identity={}, source={}",
            manager.identity(),
            source.as_str()
        );

        match (&source, ca_client) {
            (CredentialSource::FileBacked(paths), _) => {
                let workload_material = FileMaterial::Cert {
                    cert_chain: paths.cert_chain.clone(),
                    private_key: paths.private_key.clone(),
                    root_cert: Some(paths.root_cert.clone()),
                };
                let root_material = FileMaterial::Root(paths.root_cert.clone());

                // Startup load is fatal; later reload failures are retried.
                let workload_cert = workload_material.load(WORKLOAD_RESOURCE).await?;
                let root_cert = root_material.load(ROOT_RESOURCE).await?;

                let inner = manager.inner();
                for (name, cert, material) in [
                    (WORKLOAD_RESOURCE, workload_cert, workload_material),
                    (ROOT_RESOURCE, root_cert, root_material),
                ] {
                    let slot = inner.slot(name);
                    let attempt = slot.begin_attempt();
                    inner.install(&slot, Arc::new(cert), attempt);
                    slot.set_state(ResourceState::Active);
                    manager.start_file_reload(slot, material);
                }
            }
            (_, Some(ca)) => manager.start_issuer(ca),
            (_, None) => return Err(ConfigError::MissingCaEndpoint.into()),
        }

        if let Some(timeout) = initial_fetch_timeout {
            manager.wait_ready(timeout).await?;
        }
        Ok(manager)
    }
}
