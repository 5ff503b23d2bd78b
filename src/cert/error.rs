//! Error types for certificate and private key parsing/validation.

use crate::identity::IdentityError;
use x509_parser::asn1_rs::Oid;
use x509_parser::error::X509Error;

/// An error that may arise parsing and validating PEM certificate material.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// The PEM input contained no certificate block.
    #[error("no certificate found in PEM input")]
    Empty,

    /// The PEM framing could not be decoded.
    #[error("malformed PEM input: {0}")]
    Pem(String),

    /// A PEM block carried a label other than `CERTIFICATE`.
    #[error("unexpected PEM block `{0}` in certificate input")]
    UnexpectedPemLabel(String),

    /// The chain has more certificates than will be processed.
    #[error("certificate chain is too long (max {max})")]
    TooManyCertificates {
        /// Maximum number of certificates accepted in a chain.
        max: usize,
    },

    /// Error returned by the X.509 parsing library.
    #[error("failed parsing X.509 certificate")]
    ParseX509Certificate(#[from] X509Error),

    /// The leaf's validity window is empty or inverted.
    #[error("certificate validity window is empty (not_after <= not_before)")]
    InvalidValidity,

    /// An X.509 extension cannot be found.
    #[error("X.509 extension is missing: {0}")]
    MissingX509Extension(Oid<'static>),

    /// Unexpected X.509 extension encountered.
    #[error("unexpected X.509 extension: {0}")]
    UnexpectedExtension(String),

    /// The leaf has more URI SAN entries than will be inspected.
    #[error("certificate has too many URI SAN entries (max {max})")]
    TooManyUriSanEntries {
        /// Maximum number of URI SAN entries inspected before aborting.
        max: usize,
    },

    /// A `spiffe://` URI SAN failed to parse.
    #[error("failed to parse SPIFFE ID from URI SAN: {0}")]
    InvalidSpiffeId(#[from] IdentityError),

    /// The private key is missing or malformed.
    #[error(transparent)]
    PrivateKey(#[from] PrivateKeyError),
}

/// An error that may arise decoding private keys.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum PrivateKeyError {
    /// No PEM block was found.
    #[error("no private key found in PEM input")]
    Missing,

    /// The PEM framing could not be decoded.
    #[error("malformed private key PEM: {0}")]
    Pem(String),

    /// The PEM label is not a private key label.
    #[error("unsupported private key PEM block `{0}`")]
    UnsupportedLabel(String),

    /// Error returned by the PKCS#8 decoder.
    #[error("failed decoding PKCS#8 private key")]
    DecodePkcs8(pkcs8::Error),
}
