//! Certificate authority client.
//!
//! [`CaClient`] performs one CSR exchange; [`request_with_retry`] drives it
//! with a fresh key, CSR and credential per attempt until the CA answers,
//! fails permanently, or shutdown cancels the loop.

mod csr;
mod error;
mod grpc;
mod retry;

pub use csr::{CsrParams, CsrRequest, KeyAlgorithm};
pub use error::CaError;
pub use grpc::GrpcCaClient;
pub use retry::{request_with_retry, IssuedCertificate};

use crate::auth::CallCredential;
use std::future::Future;
use std::pin::Pin;

/// Generated protobuf types for the CSR signing service.
#[allow(missing_docs, clippy::all, clippy::pedantic)]
pub mod pb {
    tonic::include_proto!("istio.v1.auth");
}

/// Future returned by [`CaClient::request_certificate`].
pub type CaFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<String>, CaError>> + Send + 'a>>;

/// One CSR exchange with a certificate authority.
///
/// Implementations attach `credential` to the call and return the signed
/// chain as PEM certificates, leaf first and root last. They never retry.
pub trait CaClient: Send + Sync + 'static {
    /// Submits `csr` authenticated with `credential`.
    fn request_certificate<'a>(
        &'a self,
        csr: &'a CsrRequest,
        credential: &'a CallCredential,
    ) -> CaFuture<'a>;
}
