//! Secret discovery for the local proxy.
//!
//! [`SdsServer`] answers [`SdsRequest`]s with the current values held by a
//! [`RotationManager`](crate::rotation::RotationManager) and keeps streams
//! open to push every rotation. The types here are independent of any wire
//! transport; an Envoy SDS gRPC front-end maps onto them one to one.
//!
//! ```no_run
//! use futures::StreamExt;
//! use identity_agent::sds::{SdsRequest, SdsServer};
//! use identity_agent::{CredentialConfig, RotationManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = RotationManager::builder(CredentialConfig::default()).build().await?;
//! let server = SdsServer::new(manager);
//!
//! let request = SdsRequest::new(["default", "ROOTCA"]);
//! let mut responses = server.stream_secrets(futures::stream::iter([request]));
//! while let Some(response) = responses.next().await {
//!     let response = response?;
//!     println!("version {}", response.version_info);
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod server;
mod types;

pub use error::SdsError;
pub use server::{SdsServer, SdsStats, SdsStream};
pub use types::{SdsRequest, SdsResponse, SecretResource};
