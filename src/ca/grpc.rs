use crate::auth::CallCredential;
use crate::ca::pb::istio_certificate_service_client::IstioCertificateServiceClient;
use crate::ca::pb::IstioCertificateRequest;
use crate::ca::{CaClient, CaError, CaFuture, CsrRequest};
use crate::cert::load::read_file;
use crate::config::{ConfigError, CredentialConfig};
use crate::constants::AUTHORIZATION_HEADER;
use crate::prelude::debug;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate as TlsCertificate, Channel, ClientTlsConfig, Endpoint, Identity};

/// gRPC client for `IstioCertificateService/CreateCertificate`.
///
/// Bearer calls share one lazily connected channel. mTLS calls build a
/// dedicated channel carrying the client identity, so a rotated certificate is
/// presented on the very next attempt.
pub struct GrpcCaClient {
    endpoint: Endpoint,
    tls: Option<ClientTlsConfig>,
    timeout: Duration,
    shared: OnceLock<Channel>,
}

impl fmt::Debug for GrpcCaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcCaClient")
            .field("endpoint", &self.endpoint.uri())
            .field("tls", &self.tls.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GrpcCaClient {
    /// Builds a client from `ca_endpoint`, `ca_root_cert`, `ca_tls_server_name`
    /// and `ca_request_timeout`. The timeout bounds both connecting and each call.
    ///
    /// `https` endpoints require `ca_root_cert`; plain `http` is accepted for
    /// local or test CAs.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the endpoint is missing or invalid, or the
    /// CA root cannot be read.
    pub async fn from_config(config: &CredentialConfig) -> Result<Self, ConfigError> {
        let raw = config
            .ca_endpoint
            .clone()
            .ok_or(ConfigError::MissingCaEndpoint)?;
        let invalid = |reason: String| ConfigError::InvalidCaEndpoint {
            endpoint: raw.clone(),
            reason,
        };

        // Bounds the TCP and TLS handshake of every channel, not only the call.
        let endpoint = Endpoint::from_shared(raw.clone())
            .map_err(|e| invalid(e.to_string()))?
            .connect_timeout(config.ca_request_timeout);
        let tls = match endpoint.uri().scheme_str() {
            Some("https") => {
                let root_path = config
                    .ca_root_cert
                    .as_deref()
                    .ok_or_else(|| invalid("https endpoint requires `ca_root_cert`".to_owned()))?;
                let root = read_file(root_path)
                    .await
                    .map_err(|e| ConfigError::UnreadableCaRoot {
                        path: root_path.to_path_buf(),
                        reason: e.to_string(),
                    })?;
                let mut tls = ClientTlsConfig::new().ca_certificate(TlsCertificate::from_pem(root));
                if let Some(name) = &config.ca_tls_server_name {
                    tls = tls.domain_name(name.clone());
                }
                Some(tls)
            }
            Some("http") => None,
            other => {
                return Err(invalid(format!(
                    "unsupported scheme `{}`",
                    other.unwrap_or_default()
                )))
            }
        };

        let endpoint = match &tls {
            Some(tls) => endpoint
                .tls_config(tls.clone())
                .map_err(|e| invalid(e.to_string()))?,
            None => endpoint,
        };

        Ok(Self {
            endpoint,
            tls,
            timeout: config.ca_request_timeout,
            shared: OnceLock::new(),
        })
    }

    fn shared_channel(&self) -> Channel {
        self.shared
            .get_or_init(|| self.endpoint.connect_lazy())
            .clone()
    }

    async fn channel_for(&self, credential: &CallCredential) -> Result<Channel, CaError> {
        match credential {
            CallCredential::Bearer(_) => Ok(self.shared_channel()),
            CallCredential::Mtls(identity) => {
                let tls = self.tls.clone().ok_or_else(|| {
                    CaError::Invalid("client certificate requires an https CA endpoint".to_owned())
                })?;
                let tls = tls.identity(Identity::from_pem(
                    identity.cert_chain_pem(),
                    identity.private_key_pem(),
                ));
                let channel = self.endpoint.clone().tls_config(tls)?.connect().await?;
                Ok(channel)
            }
        }
    }

    async fn create_certificate(
        &self,
        csr: &CsrRequest,
        credential: &CallCredential,
    ) -> Result<Vec<String>, CaError> {
        let channel = self.channel_for(credential).await?;
        let mut client = IstioCertificateServiceClient::new(channel);

        let validity = i64::try_from(csr.ttl().as_secs()).unwrap_or(i64::MAX);
        let mut request = tonic::Request::new(IstioCertificateRequest {
            csr: csr.csr_pem().to_owned(),
            validity_duration: validity,
        });
        request.set_timeout(self.timeout);

        if let CallCredential::Bearer(token) = credential {
            if !token.is_empty() {
                let value = MetadataValue::try_from(format!("Bearer {}", token.value()))
                    .map_err(|_| CaError::Invalid("token is not valid header text".to_owned()))?;
                request.metadata_mut().insert(AUTHORIZATION_HEADER, value);
            }
        }

        debug!(
            "Requesting certificate: identity={}, credential={}",
            csr.identity(),
            credential.describe()
        );
        let response = client.create_certificate(request).await?.into_inner();
        if response.cert_chain.is_empty() {
            return Err(CaError::Invalid(
                "certificate authority returned an empty chain".to_owned(),
            ));
        }
        Ok(response.cert_chain)
    }
}

impl CaClient for GrpcCaClient {
    fn request_certificate<'a>(
        &'a self,
        csr: &'a CsrRequest,
        credential: &'a CallCredential,
    ) -> CaFuture<'a> {
        Box::pin(self.create_certificate(csr, credential))
    }
}
