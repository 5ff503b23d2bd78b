use crate::auth::{AuthError, AuthTarget, Authenticator};
use crate::backoff::{
    retry_with_backoff, ErrorKey, ErrorTracker, ReconnectConfig, RetryStop,
    MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::ca::{CaClient, CaError, CsrParams, CsrRequest};
use crate::cert::{Certificate, PrivateKey};
use crate::prelude::{debug, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A chain signed by the CA together with the key generated for it.
#[derive(Debug)]
pub struct IssuedCertificate {
    /// PEM certificates as returned by the CA, leaf first and root last.
    pub cert_chain: Vec<String>,
    /// Key matching the leaf.
    pub private_key: PrivateKey,
}

impl IssuedCertificate {
    /// Validates the response and builds the resource value.
    ///
    /// With more than one certificate the last one is the root bundle and the
    /// rest form the chain. A bare leaf takes `fallback_root` (the configured
    /// CA root) as its bundle.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Invalid`] if the chain is empty or does not parse.
    pub fn into_certificate(
        self,
        resource_name: &str,
        fallback_root: Option<&[u8]>,
    ) -> Result<Certificate, CaError> {
        let (root, chain) = match self.cert_chain.split_last() {
            None => return Err(CaError::Invalid("empty certificate chain".to_owned())),
            Some((root, chain)) if !chain.is_empty() => {
                (root.as_bytes().to_vec(), join_pem(chain))
            }
            Some((leaf, _)) => (
                fallback_root.map(<[u8]>::to_vec).unwrap_or_default(),
                ensure_trailing_newline(leaf).into_bytes(),
            ),
        };
        Certificate::from_pem(
            resource_name,
            chain,
            self.private_key.as_pem().to_vec(),
            root,
        )
        .map_err(|e| CaError::Invalid(format!("certificate authority response: {e}")))
    }
}

fn ensure_trailing_newline(pem: &str) -> String {
    if pem.ends_with('\n') {
        pem.to_owned()
    } else {
        format!("{pem}\n")
    }
}

fn join_pem(certs: &[String]) -> Vec<u8> {
    certs
        .iter()
        .map(|c| ensure_trailing_newline(c))
        .collect::<String>()
        .into_bytes()
}

fn error_key(err: &CaError) -> ErrorKey {
    match err {
        CaError::Unauthenticated(_) => ErrorKey::CaUnauthenticated,
        CaError::Credential(AuthError::Token(_)) => ErrorKey::Token,
        CaError::Credential(_) => ErrorKey::FileLoad,
        _ => ErrorKey::CaUnavailable,
    }
}

/// Requests a certificate described by `params`, retrying until the CA signs it.
///
/// Every attempt generates a new key and CSR and asks `authenticator` for a
/// fresh CA credential, so a rotated token file or a newly issued client
/// certificate is used on the next try. Unavailable CAs, rejected credentials
/// and retryable token failures back off per `reconnect` with no attempt
/// limit. `on_retry` observes each absorbed failure and the delay after it.
///
/// # Errors
///
/// Returns [`CaError::Cancelled`] when `cancel` fires, or the first
/// non-transient error (malformed response, permanent token failure).
pub async fn request_with_retry<F>(
    client: &dyn CaClient,
    authenticator: &Authenticator,
    params: &CsrParams,
    reconnect: ReconnectConfig,
    cancel: &CancellationToken,
    mut on_retry: F,
) -> Result<IssuedCertificate, CaError>
where
    F: FnMut(&CaError, Duration),
{
    let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
    let result = retry_with_backoff(
        reconnect.normalize(),
        cancel,
        move || async move {
            let csr = CsrRequest::generate(params)?;
            let credential = authenticator
                .credential_for(AuthTarget::CertificateAuthority)
                .await?;
            let cert_chain = client.request_certificate(&csr, &credential).await?;
            Ok::<_, CaError>(IssuedCertificate {
                cert_chain,
                private_key: csr.private_key().clone(),
            })
        },
        |err: &CaError, delay| {
            if tracker.record_error(error_key(err)) {
                warn!(
                    "Certificate request failed; retrying: error={}, backoff_ms={}",
                    err,
                    delay.as_millis()
                );
            } else {
                debug!(
                    "Certificate request failed (repeated); retrying: error={}, consecutive_failures={}",
                    err,
                    tracker.consecutive_count()
                );
            }
            on_retry(err, delay);
        },
    )
    .await;

    match result {
        Ok(issued) => Ok(issued),
        Err(RetryStop::Cancelled) => Err(CaError::Cancelled),
        Err(RetryStop::Permanent(e)) => Err(e),
    }
}
