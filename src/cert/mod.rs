//! Certificate material served to the proxy and presented to peers.
//!
//! A [`Certificate`] is the immutable unit the rotation manager swaps: a PEM
//! chain, its private key, the root bundle, and the leaf's validity window.
//! Everything is validated at construction time.

use crate::cert::error::{CertificateError, PrivateKeyError};
use crate::cert::parsing::{
    extract_spiffe_ids_from_uri_san, parse_der_encoded_bytes_as_x509_certificate,
    pem_private_key_der, pem_to_der_bundle, pem_to_der_chain, validity_of,
};
use crate::identity::SpiffeId;
use std::fmt;
use time::OffsetDateTime;
use zeroize::Zeroize;

pub mod error;
pub mod load;
pub(crate) mod parsing;

/// A PEM-encoded private key.
///
/// Invariant: the PEM decodes to a PKCS#8, SEC1 or PKCS#1 key block.
///
/// This type is zeroized on drop.
#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// Validates and wraps PEM key bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`PrivateKeyError`] if no key block is present or the block is
    /// not a decodable key.
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Result<Self, PrivateKeyError> {
        let pem = pem.into();
        let mut der = pem_private_key_der(&pem)?;
        der.zeroize();
        Ok(Self(pem))
    }

    /// Returns the PEM bytes.
    pub fn as_pem(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PrivateKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.0.len())
            .finish()
    }
}

/// One version of a named secret resource.
///
/// Workload resources carry a chain, a key and (usually) a root bundle; root
/// resources carry only the root bundle. Values are never mutated: a rotation
/// builds a new `Certificate` and swaps it in.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    resource_name: String,
    cert_chain: Vec<u8>,
    private_key: Option<PrivateKey>,
    root_cert: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl Certificate {
    /// Builds a workload certificate from PEM material.
    ///
    /// `root_pem` may be empty when no root bundle is known. Validity is taken
    /// from the first certificate of `chain_pem`.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if the chain is empty or unparseable, the
    /// key is invalid, or a non-empty root bundle is unparseable.
    pub fn from_pem(
        resource_name: impl Into<String>,
        chain_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
        root_pem: impl Into<Vec<u8>>,
    ) -> Result<Self, CertificateError> {
        let cert_chain = chain_pem.into();
        let root_cert = root_pem.into();

        let chain = pem_to_der_chain(&cert_chain)?;
        let (not_before, not_after) = validity_of(&chain[0])?;
        let private_key = PrivateKey::from_pem(key_pem)?;
        if !is_blank(&root_cert) {
            pem_to_der_bundle(&root_cert)?;
        }

        Ok(Self {
            resource_name: resource_name.into(),
            cert_chain,
            private_key: Some(private_key),
            root_cert,
            not_before,
            not_after,
        })
    }

    /// Builds a root-only resource from a PEM bundle.
    ///
    /// Validity is taken from the first certificate of the bundle.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if the bundle is empty or unparseable.
    pub fn root_from_pem(
        resource_name: impl Into<String>,
        root_pem: impl Into<Vec<u8>>,
    ) -> Result<Self, CertificateError> {
        let root_cert = root_pem.into();
        let roots = pem_to_der_bundle(&root_cert)?;
        let (not_before, not_after) = validity_of(&roots[0])?;

        Ok(Self {
            resource_name: resource_name.into(),
            cert_chain: Vec::new(),
            private_key: None,
            root_cert,
            not_before,
            not_after,
        })
    }

    /// Derives the root-only resource carried by this workload certificate.
    ///
    /// Returns `Ok(None)` when no root bundle is attached.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if the attached bundle fails to parse.
    pub fn root_resource(
        &self,
        resource_name: impl Into<String>,
    ) -> Result<Option<Self>, CertificateError> {
        if is_blank(&self.root_cert) {
            return Ok(None);
        }
        Self::root_from_pem(resource_name, self.root_cert.clone()).map(Some)
    }

    /// Returns a copy of this value registered under another resource name.
    #[must_use]
    pub fn renamed(&self, resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            ..self.clone()
        }
    }

    /// Returns the resource name this value was produced for.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Returns the PEM certificate chain (leaf first). Empty for root-only resources.
    pub fn cert_chain_pem(&self) -> &[u8] {
        &self.cert_chain
    }

    /// Returns the private key, or `None` for root-only resources.
    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    /// Returns the PEM root bundle. May be empty for workload resources.
    pub fn root_cert_pem(&self) -> &[u8] {
        &self.root_cert
    }

    /// Returns `true` if this value holds only a root bundle.
    pub fn is_root_only(&self) -> bool {
        self.private_key.is_none()
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Total validity, `not_after - not_before`.
    pub fn lifetime(&self) -> time::Duration {
        self.not_after - self.not_before
    }

    /// Returns `true` if `now` is past `not_after`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }

    /// Returns `true` if this value expires strictly later than `other`.
    ///
    /// Installs only ever move forward along this order.
    pub fn is_fresher_than(&self, other: &Certificate) -> bool {
        self.not_after > other.not_after
    }

    /// Returns the single SPIFFE ID in the leaf's URI SAN, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if the leaf cannot be parsed or its SAN
    /// extension is malformed.
    pub fn spiffe_id(&self) -> Result<Option<SpiffeId>, CertificateError> {
        let chain = if self.is_root_only() {
            pem_to_der_bundle(&self.root_cert)?
        } else {
            pem_to_der_chain(&self.cert_chain)?
        };
        let leaf = parse_der_encoded_bytes_as_x509_certificate(&chain[0])?;
        match extract_spiffe_ids_from_uri_san(&leaf) {
            Ok(ids) => Ok(ids.into_iter().next()),
            Err(CertificateError::MissingX509Extension(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("resource_name", &self.resource_name)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &self.private_key)
            .field("root_cert_len", &self.root_cert.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}
