#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{
    accept_any, eventually, fast_reconnect, replace_material, require_mtls, rotate_trust_root,
    snapshot_files, write_material, MockCa, RecordingMetrics, TestCa, WORKLOAD_URI,
};
use futures::StreamExt;
use identity_agent::auth::{AuthTarget, CallCredential, IdentityOrigin};
use identity_agent::constants::{ROOT_RESOURCE, WORKLOAD_RESOURCE};
use identity_agent::rotation::schedule::renewal_delay;
use identity_agent::rotation::{MetricsErrorKind, ResourceState, RotationError};
use identity_agent::sds::{SdsRequest, SdsServer};
use identity_agent::source::{file_cert_resource_name, file_root_resource_name};
use identity_agent::{
    Certificate, CredentialConfig, CredentialSource, ReconnectConfig, RotationManager,
};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const HOUR: Duration = Duration::from_secs(3600);

fn ca_config() -> CredentialConfig {
    CredentialConfig {
        reconnect: fast_reconnect(),
        sds_request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn file_config(dir: &std::path::Path) -> CredentialConfig {
    CredentialConfig {
        file_mounted_certs: true,
        file_cert_chain: Some(dir.join("cert-chain.pem")),
        file_private_key: Some(dir.join("key.pem")),
        file_root_cert: Some(dir.join("root-cert.pem")),
        grace_ratio: 1.0,
        ..ca_config()
    }
}

#[tokio::test]
async fn file_rotation_is_pushed_to_every_open_stream() {
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    write_material(dir.path(), &ca, HOUR);

    let manager = RotationManager::builder(file_config(dir.path()))
        .build()
        .await
        .unwrap();
    assert!(matches!(manager.source(), CredentialSource::FileBacked(_)));
    let server = SdsServer::new(manager.clone());

    let request = SdsRequest::new([WORKLOAD_RESOURCE, ROOT_RESOURCE]);
    let open = |request: SdsRequest| {
        server.stream_secrets(futures::stream::iter([request]).chain(futures::stream::pending()))
    };
    let mut first = open(request.clone());
    let mut second = open(request);

    let initial = first.next().await.unwrap().unwrap();
    assert_eq!(second.next().await.unwrap().unwrap().resources, initial.resources);
    assert_eq!(initial.resource(WORKLOAD_RESOURCE).unwrap().version, 1);

    let replaced = replace_material(dir.path(), &ca, 2 * HOUR);

    let wait = Duration::from_secs(5);
    let pushed_first = tokio::time::timeout(wait, first.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let pushed_second = tokio::time::timeout(wait, second.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    for pushed in [&pushed_first, &pushed_second] {
        let workload = pushed.resource(WORKLOAD_RESOURCE).unwrap();
        assert_eq!(workload.version, 2);
        assert_eq!(
            workload.certificate.cert_chain_pem(),
            replaced.chain_pem.as_bytes()
        );
        // The root bundle did not change.
        assert_eq!(pushed.resource(ROOT_RESOURCE).unwrap().version, 1);
    }
    assert_eq!(pushed_first.version_info, pushed_second.version_info);
    assert!(Arc::ptr_eq(
        &pushed_first.resource(WORKLOAD_RESOURCE).unwrap().certificate,
        &pushed_second.resource(WORKLOAD_RESOURCE).unwrap().certificate,
    ));
    assert_eq!(first.stats().pushes, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn trust_root_rotation_replaces_the_served_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let old_ca = TestCa::new();
    write_material(dir.path(), &old_ca, HOUR);

    let manager = RotationManager::builder(file_config(dir.path()))
        .build()
        .await
        .unwrap();
    let server = SdsServer::new(manager.clone());
    let mut stream = server.stream_secrets(
        futures::stream::iter([SdsRequest::new([WORKLOAD_RESOURCE, ROOT_RESOURCE])])
            .chain(futures::stream::pending()),
    );
    let initial = stream.next().await.unwrap().unwrap();
    assert_eq!(initial.resource(ROOT_RESOURCE).unwrap().version, 1);

    // The new root expires well before the old one.
    let new_ca = TestCa::with_lifetime(time::Duration::days(30));
    let replaced = rotate_trust_root(dir.path(), &new_ca, 2 * HOUR);

    let rotated = |manager: &RotationManager| {
        manager
            .certificate(ROOT_RESOURCE)
            .is_some_and(|root| root.root_cert_pem() == new_ca.root_pem().as_bytes())
            && manager
                .certificate(WORKLOAD_RESOURCE)
                .is_some_and(|cert| cert.cert_chain_pem() == replaced.chain_pem.as_bytes())
    };
    assert!(eventually(Duration::from_secs(5), || rotated(&manager)).await);

    let root = manager.versioned(ROOT_RESOURCE).unwrap();
    assert_eq!(root.generation, 2);
    let initial_root = &initial.resource(ROOT_RESOURCE).unwrap().certificate;
    assert!(root.certificate.not_after() < initial_root.not_after());
    let workload = manager.certificate(WORKLOAD_RESOURCE).unwrap();
    assert_eq!(workload.root_cert_pem(), new_ca.root_pem().as_bytes());

    // Re-reading the same root does not announce it again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.versioned(ROOT_RESOURCE).unwrap().generation, 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn capped_expiry_does_not_flood_the_ca() {
    let not_after = OffsetDateTime::now_utc() + time::Duration::hours(1);
    let ca = Arc::new(MockCa::new(accept_any()).with_fixed_expiry(not_after));
    let config = CredentialConfig {
        grace_ratio: 1.0,
        reconnect: ReconnectConfig {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        },
        ..ca_config()
    };
    let manager = RotationManager::builder(config)
        .ca_client(ca.clone())
        .build()
        .await
        .unwrap();
    let first = manager.wait_ready(Duration::from_secs(5)).await.unwrap();

    // Every renewal comes back with the same expiry and is discarded. At the
    // 10ms floor a second would take about a hundred requests; backing off
    // towards 200ms keeps it to a handful.
    let start = ca.attempts();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let requested = ca.attempts() - start;
    assert!(requested >= 2, "renewal stopped: {requested}");
    assert!(requested <= 15, "renewal spun: {requested}");

    let current = manager.versioned(WORKLOAD_RESOURCE).unwrap();
    assert_eq!(current.generation, first.generation);

    manager.shutdown().await;
}

#[tokio::test]
async fn serving_continues_while_the_ca_is_down() {
    // One certificate, then an outage until the limit is lifted.
    let ca = Arc::new(
        MockCa::new(accept_any())
            .with_ttls([HOUR, 2 * HOUR])
            .with_issue_limit(1),
    );
    let config = CredentialConfig {
        grace_ratio: 1.0,
        ..ca_config()
    };
    let manager = RotationManager::builder(config)
        .ca_client(ca.clone())
        .build()
        .await
        .unwrap();
    let server = SdsServer::new(manager.clone());

    let first = manager.wait_ready(Duration::from_secs(5)).await.unwrap();

    let attempts = ca.attempts();
    assert!(eventually(Duration::from_secs(5), || ca.attempts() > attempts + 3).await);

    let status = manager.status(WORKLOAD_RESOURCE).unwrap();
    assert_eq!(status.state, ResourceState::Renewing);
    assert!(status.consecutive_failures > 0);

    // The installed certificate is still served.
    let response = server
        .fetch_secrets(SdsRequest::new([WORKLOAD_RESOURCE]))
        .await
        .unwrap();
    let served = response.resource(WORKLOAD_RESOURCE).unwrap();
    assert_eq!(served.version, first.generation);
    assert_eq!(served.certificate, first.certificate);

    ca.set_issue_limit(u32::MAX);
    let mut updates = manager.resource_updates(WORKLOAD_RESOURCE).unwrap();
    let generation = tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|g| *g >= 2))
        .await
        .unwrap()
        .unwrap();
    assert!(generation >= 2);
    assert_eq!(
        manager.status(WORKLOAD_RESOURCE).unwrap().consecutive_failures,
        0
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn earlier_expiring_results_are_discarded() {
    let ca = Arc::new(MockCa::new(accept_any()).with_ttls([2 * HOUR, HOUR]));
    let metrics = Arc::new(RecordingMetrics::default());
    let config = CredentialConfig {
        grace_ratio: 1.0,
        ..ca_config()
    };
    let manager = RotationManager::builder(config)
        .ca_client(ca.clone())
        .metrics(metrics.clone())
        .build()
        .await
        .unwrap();

    let first = manager.wait_ready(Duration::from_secs(5)).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || ca.issued() >= 3).await);

    let current = manager.versioned(WORKLOAD_RESOURCE).unwrap();
    assert_eq!(current.generation, first.generation);
    assert_eq!(
        current.certificate.not_after(),
        first.certificate.not_after()
    );
    assert!(metrics
        .errors
        .lock()
        .unwrap()
        .contains(&MetricsErrorKind::StaleResult));

    manager.shutdown().await;
}

#[tokio::test]
async fn grace_ratio_bounds_the_renewal_schedule() {
    let ca = TestCa::new();
    let issued = ca.issue(WORKLOAD_URI, HOUR);
    let cert =
        Certificate::from_pem(WORKLOAD_RESOURCE, issued.chain_pem, issued.key_pem, "").unwrap();
    let now = OffsetDateTime::now_utc();
    let floor = Duration::from_millis(10);

    assert_eq!(renewal_delay(&cert, 1.0, now, floor), floor);
    let near_expiry = renewal_delay(&cert, 0.0, now, floor);
    assert!(near_expiry > Duration::from_secs(3500) && near_expiry <= HOUR);

    // Behaviour: ratio 0 leaves a fresh certificate alone, ratio 1 renews at once.
    for (ratio, renews) in [(0.0, false), (1.0, true)] {
        let ca = Arc::new(MockCa::new(accept_any()));
        let config = CredentialConfig {
            grace_ratio: ratio,
            ..ca_config()
        };
        let manager = RotationManager::builder(config)
            .ca_client(ca.clone())
            .build()
            .await
            .unwrap();
        manager.wait_ready(Duration::from_secs(5)).await.unwrap();
        let renewed = eventually(Duration::from_millis(300), || ca.issued() > 1).await;
        assert_eq!(renewed, renews, "grace_ratio={ratio}");
        manager.shutdown().await;
    }
}

#[tokio::test]
async fn shutdown_unblocks_waiting_callers() {
    let ca = Arc::new(MockCa::new(accept_any()).unavailable_for(u32::MAX));
    let manager = RotationManager::builder(ca_config())
        .ca_client(ca.clone())
        .build()
        .await
        .unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.wait_ready(Duration::from_secs(60)).await })
    };
    assert!(eventually(Duration::from_secs(5), || ca.attempts() > 0).await);

    manager.shutdown_with_timeout(Duration::from_secs(5)).await.unwrap();
    assert!(matches!(waiter.await.unwrap(), Err(RotationError::Closed)));
    assert_eq!(
        manager.status(WORKLOAD_RESOURCE).unwrap().state,
        ResourceState::Closed
    );
    assert!(manager.is_closed());
    assert!(matches!(
        manager.ensure_resource(WORKLOAD_RESOURCE),
        Err(RotationError::Closed)
    ));
}

#[tokio::test]
async fn provisioned_material_authenticates_and_is_left_untouched() {
    const FILES: [&str; 3] = ["cert-chain.pem", "key.pem", "root-cert.pem"];
    let provisioned = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let bootstrap_ca = TestCa::new();
    write_material(provisioned.path(), &bootstrap_ca, 365 * 24 * HOUR);
    let before = snapshot_files(provisioned.path(), &FILES);

    // Short-lived, strictly later certificates so every renewal installs.
    let ca = Arc::new(
        MockCa::new(require_mtls(IdentityOrigin::Provisioned))
            .with_ttls([HOUR, 2 * HOUR, 3 * HOUR]),
    );
    let config = CredentialConfig {
        provisioned_cert_dir: Some(provisioned.path().to_path_buf()),
        output_dir: Some(output.path().to_path_buf()),
        initial_fetch_timeout: Some(Duration::from_secs(5)),
        grace_ratio: 1.0,
        ..ca_config()
    };
    let manager = RotationManager::builder(config)
        .ca_client(ca.clone())
        .build()
        .await
        .unwrap();
    assert!(matches!(
        manager.source(),
        CredentialSource::ProvisionedBacked(_)
    ));

    let mut updates = manager.resource_updates(WORKLOAD_RESOURCE).unwrap();
    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|g| *g >= 3))
        .await
        .unwrap()
        .unwrap();
    assert!(ca.issued() >= 3);
    assert!(ca
        .credentials
        .lock()
        .unwrap()
        .iter()
        .all(|credential| *credential == "mtls(provisioned)"));

    // The control plane is reached with the provisioned identity too.
    match manager
        .authenticator()
        .credential_for(AuthTarget::ControlPlane)
        .await
        .unwrap()
    {
        CallCredential::Mtls(identity) => {
            assert_eq!(identity.origin(), IdentityOrigin::Provisioned);
            assert_eq!(identity.cert_chain_pem(), before[0].0.as_slice());
        }
        other => panic!("expected mTLS, got {}", other.describe()),
    }

    assert_eq!(before, snapshot_files(provisioned.path(), &FILES));

    // The CA-issued certificate went to the output directory instead.
    let written = std::fs::read(output.path().join("cert-chain.pem")).unwrap();
    assert_ne!(written, before[0].0);
    assert!(eventually(Duration::from_secs(2), || {
        std::fs::read(output.path().join("cert-chain.pem")).unwrap()
            == manager.certificate(WORKLOAD_RESOURCE).unwrap().cert_chain_pem()
    })
    .await);

    manager.shutdown().await;
}

#[tokio::test]
async fn file_resources_are_loaded_on_first_request() {
    let files = tempfile::tempdir().unwrap();
    let file_ca = TestCa::new();
    write_material(files.path(), &file_ca, HOUR);

    let ca = Arc::new(MockCa::new(accept_any()));
    let manager = RotationManager::builder(ca_config())
        .ca_client(ca.clone())
        .build()
        .await
        .unwrap();
    let server = SdsServer::new(manager.clone());

    let cert_name = file_cert_resource_name(
        &files.path().join("cert-chain.pem"),
        &files.path().join("key.pem"),
    );
    let root_name = file_root_resource_name(&files.path().join("root-cert.pem"));
    assert!(manager.status(&cert_name).is_none());

    let response = server
        .fetch_secrets(SdsRequest::new([cert_name.clone(), root_name.clone()]))
        .await
        .unwrap();
    assert_eq!(response.resource_names(), vec![cert_name.as_str(), root_name.as_str()]);
    assert_eq!(
        manager.status(&cert_name).unwrap().state,
        ResourceState::Active
    );
    let root = &response.resource(&root_name).unwrap().certificate;
    assert_eq!(
        String::from_utf8_lossy(root.root_cert_pem()).trim(),
        file_ca.root_pem().trim()
    );

    let missing = file_root_resource_name(&files.path().join("absent.pem"));
    let response = SdsServer::with_request_timeout(manager.clone(), Duration::from_millis(100))
        .fetch_secrets(SdsRequest::new([missing.clone()]))
        .await
        .unwrap();
    assert!(response.resources.is_empty());
    assert!(manager.status(&missing).unwrap().consecutive_failures > 0);

    manager.shutdown().await;
}
