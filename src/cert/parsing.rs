//! Internal PEM/DER parsing helpers.

use crate::cert::error::{CertificateError, PrivateKeyError};
use crate::identity::SpiffeId;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::oid::Oid;
use x509_parser::error::X509Error;
use x509_parser::extensions::ParsedExtension;
use x509_parser::nom::Err;
use x509_parser::oid_registry;
use x509_parser::pem::Pem;
use x509_parser::prelude::GeneralName;

const MAX_URI_SAN_ENTRIES: usize = 32;
const MAX_URI_LENGTH: usize = 2048;
const SPIFFE_SCHEME_PREFIX: &str = "spiffe://";

/// Upper bound on certificates in a workload chain: a leaf, a few
/// intermediates and a root. Root bundles are not limited.
const MAX_CERT_CHAIN_LENGTH: usize = 16;

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const PKCS8_LABEL: &str = "PRIVATE KEY";
const LEGACY_KEY_LABELS: [&str; 2] = ["EC PRIVATE KEY", "RSA PRIVATE KEY"];

/// Splits a PEM certificate chain into the DER bytes of each block,
/// validating that each parses as X.509.
pub(crate) fn pem_to_der_chain(pem: &[u8]) -> Result<Vec<Vec<u8>>, CertificateError> {
    pem_to_ders(pem, Some(MAX_CERT_CHAIN_LENGTH))
}

/// Like [`pem_to_der_chain`] for a root bundle, with no length limit.
pub(crate) fn pem_to_der_bundle(pem: &[u8]) -> Result<Vec<Vec<u8>>, CertificateError> {
    pem_to_ders(pem, None)
}

fn pem_to_ders(pem: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>, CertificateError> {
    let mut ders = Vec::new();

    for block in Pem::iter_from_buffer(pem) {
        let block = block.map_err(|e| CertificateError::Pem(e.to_string()))?;
        if block.label != CERTIFICATE_LABEL {
            return Err(CertificateError::UnexpectedPemLabel(block.label));
        }
        if let Some(max) = max.filter(|max| ders.len() >= *max) {
            return Err(CertificateError::TooManyCertificates { max });
        }
        parse_der_encoded_bytes_as_x509_certificate(&block.contents)?;
        ders.push(block.contents);
    }

    if ders.is_empty() {
        return Err(CertificateError::Empty);
    }
    Ok(ders)
}

/// Validates a PEM private key and returns its DER body.
///
/// PKCS#8 keys are fully decoded; SEC1 and PKCS#1 blocks are accepted by label.
pub(crate) fn pem_private_key_der(pem: &[u8]) -> Result<Vec<u8>, PrivateKeyError> {
    let block = Pem::iter_from_buffer(pem)
        .next()
        .ok_or(PrivateKeyError::Missing)?
        .map_err(|e| PrivateKeyError::Pem(e.to_string()))?;

    if block.label == PKCS8_LABEL {
        pkcs8::PrivateKeyInfo::try_from(block.contents.as_slice())
            .map_err(PrivateKeyError::DecodePkcs8)?;
    } else if !LEGACY_KEY_LABELS.contains(&block.label.as_str()) {
        return Err(PrivateKeyError::UnsupportedLabel(block.label));
    }
    Ok(block.contents)
}

/// Parses the given DER-encoded bytes as an X.509 certificate.
pub(crate) fn parse_der_encoded_bytes_as_x509_certificate(
    der_bytes: &[u8],
) -> Result<X509Certificate<'_>, CertificateError> {
    match x509_parser::parse_x509_certificate(der_bytes) {
        Ok((_, cert)) => Ok(cert),
        Err(Err::Incomplete(_)) => Err(CertificateError::ParseX509Certificate(
            X509Error::InvalidCertificate,
        )),
        Err(Err::Error(e) | Err::Failure(e)) => Err(CertificateError::ParseX509Certificate(e)),
    }
}

/// Returns `(not_before, not_after)` of a DER certificate.
pub(crate) fn validity_of(
    der: &[u8],
) -> Result<(OffsetDateTime, OffsetDateTime), CertificateError> {
    let cert = parse_der_encoded_bytes_as_x509_certificate(der)?;
    let validity = cert.validity();
    let not_before = validity.not_before.to_datetime();
    let not_after = validity.not_after.to_datetime();
    if not_after <= not_before {
        return Err(CertificateError::InvalidValidity);
    }
    Ok((not_before, not_after))
}

fn get_x509_extension<'a>(
    cert: &'a X509Certificate<'_>,
    oid: &Oid<'static>,
) -> Result<&'a ParsedExtension<'a>, CertificateError> {
    match cert.tbs_certificate.get_extension_unique(oid)? {
        None => Err(CertificateError::MissingX509Extension(oid.clone())),
        Some(ext) => Ok(ext.parsed_extension()),
    }
}

/// Returns every `spiffe://` URI SAN of the certificate.
pub(crate) fn extract_spiffe_ids_from_uri_san(
    cert: &X509Certificate<'_>,
) -> Result<Vec<SpiffeId>, CertificateError> {
    let ext = get_x509_extension(cert, &oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME)?;

    let san = match ext {
        ParsedExtension::SubjectAlternativeName(s) => s,
        other => return Err(CertificateError::UnexpectedExtension(format!("{other:?}"))),
    };

    let mut ids = Vec::new();
    let mut uri_count = 0usize;
    for name in &san.general_names {
        let GeneralName::URI(uri) = name else {
            continue;
        };

        uri_count += 1;
        if uri_count > MAX_URI_SAN_ENTRIES {
            return Err(CertificateError::TooManyUriSanEntries {
                max: MAX_URI_SAN_ENTRIES,
            });
        }
        if uri.len() > MAX_URI_LENGTH || !uri.starts_with(SPIFFE_SCHEME_PREFIX) {
            continue;
        }
        ids.push(SpiffeId::new(uri)?);
    }

    Ok(ids)
}
