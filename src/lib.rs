#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Workload certificate rotation and secret discovery for sidecar agents.
//!
//! The agent obtains an X.509 workload certificate, keeps it fresh, and
//! hands it (together with the trust root) to a local proxy:
//!
//! - [`source::resolve`] picks where credentials come from: mounted files, a
//!   pre-provisioned directory, or a certificate authority.
//! - [`ca`] builds a CSR and sends it to the CA, retrying with backoff.
//! - [`RotationManager`] keeps the `default` and `ROOTCA` resources filled,
//!   renews them before expiry, and mirrors them to an output directory.
//! - [`SdsServer`] answers the proxy's secret requests and pushes rotations.
//! - [`auth::Authenticator`] chooses mTLS or a bearer token for every
//!   outbound connection.
//!
//! [`Agent`] wires all of it together.
//!
//! ```no_run
//! use identity_agent::sds::SdsRequest;
//! use identity_agent::{Agent, CredentialConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CredentialConfig {
//!     ca_endpoint: Some("https://istiod.istio-system.svc:15012".into()),
//!     ca_root_cert: Some("/var/run/secrets/istio/root-cert.pem".into()),
//!     jwt_path: Some("/var/run/secrets/tokens/istio-token".into()),
//!     output_dir: Some("/etc/istio/proxy".into()),
//!     ..Default::default()
//! };
//!
//! let agent = Agent::start(config).await?;
//! agent.wait_ready(Duration::from_secs(30)).await?;
//!
//! let response = agent
//!     .sds()
//!     .fetch_secrets(SdsRequest::new(["default", "ROOTCA"]))
//!     .await?;
//! for secret in &response.resources {
//!     println!("{} v{}", secret.name, secret.version);
//! }
//!
//! # agent.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`tracing`** (default): log through `tracing`.
//! - **`logging`**: log through `log` when `tracing` is disabled.

mod backoff;
mod observability;
mod prelude;

pub mod agent;
pub mod auth;
pub mod ca;
pub mod cert;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod rotation;
pub mod sds;
pub mod source;
pub mod token;

#[cfg(test)]
mod testing;

// -----------------------
// Re-exports
// -----------------------

pub use crate::{
    agent::{Agent, AgentBuilder},
    auth::{AuthTarget, Authenticator, CallCredential},
    backoff::ReconnectConfig,
    cert::{Certificate, PrivateKey},
    config::{ConfigError, CredentialConfig},
    error::{AgentError, ErrorKind},
    identity::{SpiffeId, TrustDomain},
    rotation::{RotationManager, RotationManagerBuilder},
    sds::SdsServer,
    source::CredentialSource,
};
