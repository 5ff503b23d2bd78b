//! Well-known names shared by the rotation manager, the SDS server and the
//! disk mirror.

/// SDS resource name of the workload identity certificate.
pub const WORKLOAD_RESOURCE: &str = "default";

/// SDS resource name of the root trust bundle.
pub const ROOT_RESOURCE: &str = "ROOTCA";

/// Prefix of resource names that refer to a file-mounted certificate and key.
///
/// Full form: `file-cert:<cert-chain-path>~<private-key-path>`.
pub const FILE_CERT_PREFIX: &str = "file-cert:";

/// Prefix of resource names that refer to a file-mounted root bundle.
///
/// Full form: `file-root:<root-cert-path>`.
pub const FILE_ROOT_PREFIX: &str = "file-root:";

/// Separator between the certificate and key paths of a `file-cert:` name.
pub const FILE_CERT_SEPARATOR: char = '~';

/// Certificate chain file name inside an output or provisioning directory.
pub const CERT_CHAIN_FILE: &str = "cert-chain.pem";

/// Private key file name inside an output or provisioning directory.
pub const PRIVATE_KEY_FILE: &str = "key.pem";

/// Root certificate file name inside an output or provisioning directory.
pub const ROOT_CERT_FILE: &str = "root-cert.pem";

/// Metadata key carrying bearer tokens on CA requests.
pub(crate) const AUTHORIZATION_HEADER: &str = "authorization";
