//! Shared fixtures: an `rcgen` certificate authority and a scriptable CA client.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use identity_agent::auth::{CallCredential, IdentityOrigin};
use identity_agent::ca::{CaClient, CaError, CaFuture, CsrRequest};
use identity_agent::rotation::{MetricsErrorKind, MetricsRecorder};
use identity_agent::ReconnectConfig;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

pub const WORKLOAD_URI: &str = "spiffe://cluster.local/ns/default/sa/default";

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        min_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

pub struct TestCa {
    key: KeyPair,
    root_pem: String,
}

pub struct IssuedPem {
    pub chain_pem: String,
    pub key_pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        Self::with_lifetime(time::Duration::days(3650))
    }

    /// A CA whose root expires `lifetime` from now.
    pub fn with_lifetime(lifetime: time::Duration) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "mesh-test-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + lifetime;

        let key = KeyPair::generate().unwrap();
        let root_pem = params.self_signed(&key).unwrap().pem();
        Self { key, root_pem }
    }

    pub fn root_pem(&self) -> String {
        self.root_pem.clone()
    }

    fn issuer(&self) -> Issuer<'static, &KeyPair> {
        Issuer::from_ca_cert_pem(&self.root_pem, &self.key).unwrap()
    }

    pub fn issue(&self, uri: &str, ttl: Duration) -> IssuedPem {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.subject_alt_names = vec![SanType::URI(Ia5String::try_from(uri).unwrap())];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = now + ttl;

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer()).unwrap();
        IssuedPem {
            chain_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    pub fn sign_csr(&self, csr_pem: &str, ttl: Duration) -> String {
        self.sign_csr_until(csr_pem, OffsetDateTime::now_utc() + ttl)
    }

    pub fn sign_csr_until(&self, csr_pem: &str, not_after: OffsetDateTime) -> String {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        csr.params.not_before = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        csr.params.not_after = not_after;
        csr.signed_by(&self.issuer()).unwrap().pem()
    }
}

/// Writes `cert-chain.pem`, `key.pem` and `root-cert.pem` into `dir`.
pub fn write_material(dir: &Path, ca: &TestCa, ttl: Duration) -> IssuedPem {
    let issued = ca.issue(WORKLOAD_URI, ttl);
    std::fs::write(dir.join("cert-chain.pem"), &issued.chain_pem).unwrap();
    std::fs::write(dir.join("key.pem"), &issued.key_pem).unwrap();
    std::fs::write(dir.join("root-cert.pem"), ca.root_pem()).unwrap();
    issued
}

/// Replaces the workload files in `dir` one rename at a time, key first.
pub fn replace_material(dir: &Path, ca: &TestCa, ttl: Duration) -> IssuedPem {
    let issued = ca.issue(WORKLOAD_URI, ttl);
    for (name, contents) in [("key.pem", &issued.key_pem), ("cert-chain.pem", &issued.chain_pem)] {
        let tmp = dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, contents).unwrap();
        std::fs::rename(&tmp, dir.join(name)).unwrap();
    }
    issued
}

/// Moves the whole file set in `dir` to `ca`: root first, then key, then
/// chain, each by rename.
pub fn rotate_trust_root(dir: &Path, ca: &TestCa, ttl: Duration) -> IssuedPem {
    let issued = ca.issue(WORKLOAD_URI, ttl);
    let root = ca.root_pem();
    for (name, contents) in [
        ("root-cert.pem", &root),
        ("key.pem", &issued.key_pem),
        ("cert-chain.pem", &issued.chain_pem),
    ] {
        let tmp = dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, contents).unwrap();
        std::fs::rename(&tmp, dir.join(name)).unwrap();
    }
    issued
}

/// Bytes and modification time of each file, in order.
pub fn snapshot_files(dir: &Path, names: &[&str]) -> Vec<(Vec<u8>, std::time::SystemTime)> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            (
                std::fs::read(&path).unwrap(),
                std::fs::metadata(&path).unwrap().modified().unwrap(),
            )
        })
        .collect()
}

/// Polls `f` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

/// Decides whether a credential is accepted.
pub type AuthPolicy = Arc<dyn Fn(&CallCredential) -> Result<(), CaError> + Send + Sync>;

pub fn accept_any() -> AuthPolicy {
    Arc::new(|_| Ok(()))
}

pub fn require_bearer(expected: &'static str) -> AuthPolicy {
    Arc::new(move |credential| match credential {
        CallCredential::Bearer(token) if token.value() == expected => Ok(()),
        _ => Err(CaError::Unauthenticated("unexpected credential".into())),
    })
}

pub fn require_mtls(origin: IdentityOrigin) -> AuthPolicy {
    Arc::new(move |credential| match credential {
        CallCredential::Mtls(identity) if identity.origin() == origin => Ok(()),
        _ => Err(CaError::Unauthenticated("client certificate required".into())),
    })
}

/// In-process CA signing CSRs with [`TestCa`].
///
/// The first `reject` calls fail with `Unauthenticated`, the next
/// `unavailable` with `Unavailable`; after that `policy` decides.
pub struct MockCa {
    pub ca: TestCa,
    policy: AuthPolicy,
    reject: AtomicU32,
    unavailable: AtomicU32,
    down: AtomicBool,
    issue_limit: AtomicU32,
    ttls: Mutex<VecDeque<Duration>>,
    default_ttl: Duration,
    fixed_not_after: Option<OffsetDateTime>,
    include_root: bool,
    pub attempts: AtomicU32,
    pub issued: AtomicU32,
    pub credentials: Mutex<Vec<&'static str>>,
    pub tokens: Mutex<Vec<String>>,
}

impl MockCa {
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            ca: TestCa::new(),
            policy,
            reject: AtomicU32::new(0),
            unavailable: AtomicU32::new(0),
            down: AtomicBool::new(false),
            issue_limit: AtomicU32::new(u32::MAX),
            ttls: Mutex::new(VecDeque::new()),
            default_ttl: Duration::from_secs(3600),
            fixed_not_after: None,
            include_root: true,
            attempts: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            credentials: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(self, n: u32) -> Self {
        self.reject.store(n, Ordering::SeqCst);
        self
    }

    pub fn unavailable_for(self, n: u32) -> Self {
        self.unavailable.store(n, Ordering::SeqCst);
        self
    }

    /// Lifetimes of successive issues; the last one repeats.
    pub fn with_ttls(self, ttls: impl IntoIterator<Item = Duration>) -> Self {
        let ttls: VecDeque<Duration> = ttls.into_iter().collect();
        let default_ttl = ttls.back().copied().unwrap_or(self.default_ttl);
        Self {
            ttls: Mutex::new(ttls),
            default_ttl,
            ..self
        }
    }

    /// Every issued certificate expires at `not_after`, like a CA capping
    /// leaves at its own expiry.
    pub fn with_fixed_expiry(self, not_after: OffsetDateTime) -> Self {
        Self {
            fixed_not_after: Some(not_after),
            ..self
        }
    }

    pub fn leaf_only(self) -> Self {
        Self {
            include_root: false,
            ..self
        }
    }

    /// Fails with `Unavailable` once `n` certificates have been issued.
    pub fn with_issue_limit(self, n: u32) -> Self {
        self.issue_limit.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_issue_limit(&self, n: u32) {
        self.issue_limit.store(n, Ordering::SeqCst);
    }

    /// While set, every call fails with `Unavailable`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }

    fn next_ttl(&self) -> Duration {
        self.ttls.lock().unwrap().pop_front().unwrap_or(self.default_ttl)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CaClient for MockCa {
    fn request_certificate<'a>(
        &'a self,
        csr: &'a CsrRequest,
        credential: &'a CallCredential,
    ) -> CaFuture<'a> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.credentials.lock().unwrap().push(credential.describe());
            if let CallCredential::Bearer(token) = credential {
                self.tokens.lock().unwrap().push(token.value().to_owned());
            }

            if Self::take(&self.reject) {
                return Err(CaError::Unauthenticated("token rejected".into()));
            }
            let exhausted =
                self.issued.load(Ordering::SeqCst) >= self.issue_limit.load(Ordering::SeqCst);
            if Self::take(&self.unavailable) || self.down.load(Ordering::SeqCst) || exhausted {
                return Err(CaError::Unavailable("connection refused".into()));
            }
            (self.policy)(credential)?;

            let leaf = match self.fixed_not_after {
                Some(not_after) => self.ca.sign_csr_until(csr.csr_pem(), not_after),
                None => self.ca.sign_csr(csr.csr_pem(), self.next_ttl()),
            };
            self.issued.fetch_add(1, Ordering::SeqCst);
            if self.include_root {
                Ok(vec![leaf, self.ca.root_pem()])
            } else {
                Ok(vec![leaf])
            }
        })
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    pub rotations: Mutex<Vec<String>>,
    pub retries: AtomicU64,
    pub errors: Mutex<Vec<MetricsErrorKind>>,
}

impl MetricsRecorder for RecordingMetrics {
    fn record_rotation(&self, resource: &str) {
        self.rotations.lock().unwrap().push(resource.to_owned());
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        self.errors.lock().unwrap().push(kind);
    }
}
