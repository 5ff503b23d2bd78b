//! Certificate rotation.
//!
//! [`RotationManager`] owns one slot per named secret resource and keeps each
//! filled:
//!
//! - `default` and `ROOTCA` come from the CA (or from mounted files when the
//!   credential source is file-backed) and are renewed once `grace_ratio` of
//!   the validity window remains.
//! - `file-cert:<chain>~<key>` and `file-root:<root>` are read from disk on
//!   first request and re-read on the same schedule.
//!
//! Every slot moves through [`ResourceState`]. Installs are atomic, only ever
//! move to a strictly later `not_after`, and are announced on
//! [`RotationManager::subscribe`] and per-resource [`ResourceUpdates`].
//!
//! Use [`RotationManager::shutdown_configured`] to stop background tasks.

mod builder;
mod disk;
mod errors;
mod manager;
mod metrics;
mod resource;
pub mod schedule;
mod state;
mod supervisor;

pub use builder::RotationManagerBuilder;
pub use errors::{MetricsErrorKind, RotationError};
pub use manager::{ResourceEvent, RotationManager};
pub use metrics::MetricsRecorder;
pub use resource::ResourceName;
pub use state::{ResourceState, ResourceStatus, ResourceUpdates, VersionedCertificate};
