//! Test-only certificate authority backed by `rcgen`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    SanType,
};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

pub(crate) struct IssuedPem {
    pub(crate) chain_pem: String,
    pub(crate) key_pem: String,
}

pub(crate) struct TestCa {
    key: KeyPair,
    root_pem: String,
}

impl TestCa {
    pub(crate) fn new() -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "test-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(365);

        let key = KeyPair::generate().unwrap();
        let root_pem = params.self_signed(&key).unwrap().pem();
        Self { key, root_pem }
    }

    pub(crate) fn root_pem(&self) -> String {
        self.root_pem.clone()
    }

    fn issuer(&self) -> Issuer<'static, &KeyPair> {
        Issuer::from_ca_cert_pem(&self.root_pem, &self.key).unwrap()
    }

    /// Issues a leaf valid from now for `ttl`.
    pub(crate) fn issue(&self, uri: &str, ttl: Duration) -> IssuedPem {
        let now = OffsetDateTime::now_utc();
        self.issue_between(uri, now, now + ttl)
    }

    pub(crate) fn issue_between(
        &self,
        uri: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> IssuedPem {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.subject_alt_names = vec![SanType::URI(Ia5String::try_from(uri).unwrap())];
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer()).unwrap();
        IssuedPem {
            chain_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    /// Signs a PEM CSR, keeping its SANs.
    pub(crate) fn sign_csr(&self, csr_pem: &str, ttl: Duration) -> String {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::minutes(1);
        csr.params.not_after = now + ttl;
        csr.params.is_ca = IsCa::NoCa;
        csr.signed_by(&self.issuer()).unwrap().pem()
    }
}

/// Writes `cert-chain.pem`, `key.pem` and `root-cert.pem` into `dir`.
pub(crate) fn write_material(dir: &Path, ca: &TestCa, uri: &str, ttl: Duration) -> IssuedPem {
    let issued = ca.issue(uri, ttl);
    std::fs::write(dir.join("cert-chain.pem"), &issued.chain_pem).unwrap();
    std::fs::write(dir.join("key.pem"), &issued.key_pem).unwrap();
    std::fs::write(dir.join("root-cert.pem"), ca.root_pem()).unwrap();
    issued
}
