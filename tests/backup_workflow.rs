//! Behavioural tests for the backup orchestrator against scripted APIs.

use std::io::Cursor;
use std::time::Duration;

use longhorn_br::backup::{BackupError, BackupOrchestrator};
use longhorn_br::config::PollPolicies;
use longhorn_br::model::{BackupState, CLAIM_KIND, VOLUME_KIND};
use longhorn_br::record::RecordReader;
use longhorn_br::test_support::{
    ClusterCall, NAMESPACE, STORAGE_CLASS, ScriptedCluster, ScriptedStorage, StorageCall, backup,
    claim, not_found, rejected, snapshot, volume,
};
use longhorn_br::wait::{CancelHandle, CancelToken, PollPolicy, WaitError};
use longhorn_br::{ClusterError, StorageApiError, Volume};
use rstest::{fixture, rstest};

fn fast_policies() -> PollPolicies {
    let policy = PollPolicy::new(Duration::from_millis(1), Duration::from_millis(500));
    PollPolicies {
        snapshot: policy,
        backup: policy,
        volume: policy,
    }
}

struct Harness {
    cluster: ScriptedCluster,
    storage: ScriptedStorage,
}

impl Harness {
    fn orchestrator(&self) -> BackupOrchestrator<ScriptedCluster, ScriptedStorage> {
        BackupOrchestrator::new(
            self.cluster.clone(),
            self.storage.clone(),
            NAMESPACE,
            STORAGE_CLASS,
        )
        .with_poll_policies(fast_policies())
    }

    async fn run(&self) -> (Result<longhorn_br::BackupSummary, BackupError>, Vec<u8>) {
        let mut sink = Vec::new();
        let result = self
            .orchestrator()
            .execute(&mut sink, &CancelToken::never())
            .await;
        (result, sink)
    }
}

/// Two pinned volumes whose snapshots and backups resolve immediately.
#[fixture]
fn two_volumes() -> Harness {
    let cluster = ScriptedCluster::new();
    cluster.set_volumes(vec![
        volume("pvc-a", "node-1", 1_073_741_824),
        volume("pvc-b", "node-2", 2_147_483_648),
    ]);
    for (name, url) in [("pvc-a", "u1"), ("pvc-b", "u2")] {
        let snap = format!("snap-{name}");
        let id = format!("backup-{name}");
        cluster.push_snapshot(&snap, Ok(snapshot(&snap, name)));
        cluster.push_backup(&id, Ok(backup(&id, name, BackupState::Completed, url)));
    }
    cluster.set_claims(vec![
        claim("data-a", "apps", "pvc-a", Some(STORAGE_CLASS)),
        claim("scratch", "apps", "pv-local", Some("local-path")),
        claim("data-b", "db", "pvc-b", Some(STORAGE_CLASS)),
        claim("unclassed", "apps", "pv-x", None),
    ]);
    Harness {
        cluster,
        storage: ScriptedStorage::new(),
    }
}

fn decode(artifact: &[u8]) -> Vec<longhorn_br::UntypedRecord> {
    RecordReader::new(Cursor::new(artifact))
        .collect::<Result<Vec<_>, _>>()
        .expect("artifact should parse")
}

#[rstest]
#[tokio::test]
async fn happy_path_emits_patched_volumes_then_matching_claims(two_volumes: Harness) {
    let (result, artifact) = two_volumes.run().await;
    let summary = result.expect("backup should succeed");
    assert_eq!(summary.volumes, 2);
    assert_eq!(summary.claims, 2);
    assert_eq!(summary.claims_filtered, 2);

    let records = decode(&artifact);
    let kinds: Vec<&str> = records.iter().map(longhorn_br::UntypedRecord::kind).collect();
    assert_eq!(kinds, vec![VOLUME_KIND, VOLUME_KIND, CLAIM_KIND, CLAIM_KIND]);

    let volumes: Vec<Volume> = records
        .iter()
        .take(2)
        .cloned()
        .map(|record| record.into_volume().expect("volume record"))
        .collect();
    let patched: Vec<(&str, &str, Option<&str>, u64)> = volumes
        .iter()
        .map(|v| {
            (
                v.metadata.name.as_str(),
                v.spec.node_id.as_str(),
                v.restore_source(),
                v.spec.size,
            )
        })
        .collect();
    assert_eq!(
        patched,
        vec![
            ("pvc-a", "", Some("u1"), 1_073_741_824),
            ("pvc-b", "", Some("u2"), 2_147_483_648),
        ]
    );
    assert!(
        volumes
            .iter()
            .all(|v| v.metadata.resource_version.is_none()),
        "bookkeeping should be stripped"
    );

    let claims: Vec<(String, String)> = records
        .into_iter()
        .skip(2)
        .map(|record| {
            let claim = record.into_claim().expect("claim record");
            (claim.metadata.name.clone(), claim.api_version.clone())
        })
        .collect();
    assert_eq!(
        claims,
        vec![
            (String::from("data-a"), String::from("v1")),
            (String::from("data-b"), String::from("v1")),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn phases_run_fleet_wide_in_order(two_volumes: Harness) {
    let (result, _) = two_volumes.run().await;
    result.expect("backup should succeed");

    assert_eq!(
        two_volumes.storage.calls(),
        vec![
            StorageCall::CreateSnapshot(String::from("pvc-a")),
            StorageCall::CreateSnapshot(String::from("pvc-b")),
            StorageCall::CreateBackup {
                volume: String::from("pvc-a"),
                snapshot: String::from("snap-pvc-a"),
            },
            StorageCall::CreateBackup {
                volume: String::from("pvc-b"),
                snapshot: String::from("snap-pvc-b"),
            },
        ]
    );
    let calls = two_volumes.cluster.calls();
    assert_eq!(calls.first(), Some(&ClusterCall::ListVolumes(String::from(NAMESPACE))));
    assert_eq!(calls.last(), Some(&ClusterCall::ListClaims));
}

#[tokio::test]
async fn snapshot_not_yet_visible_is_retried() {
    let cluster = ScriptedCluster::new();
    cluster.set_volumes(vec![volume("pvc-a", "node-1", 1)]);
    cluster.push_snapshot("snap-pvc-a", Err(not_found("Snapshot", "snap-pvc-a")));
    cluster.push_snapshot("snap-pvc-a", Ok(snapshot("snap-pvc-a", "pvc-a")));
    cluster.push_backup(
        "backup-pvc-a",
        Ok(backup("backup-pvc-a", "pvc-a", BackupState::Completed, "u1")),
    );
    let harness = Harness {
        cluster,
        storage: ScriptedStorage::new(),
    };

    let (result, artifact) = harness.run().await;
    result.expect("transient not-found should not surface");

    let lookups = harness
        .cluster
        .count(&ClusterCall::GetSnapshot(String::from("snap-pvc-a")));
    assert_eq!(lookups, 2);
    assert_eq!(decode(&artifact).len(), 1);
}

#[tokio::test]
async fn backup_is_polled_until_completed() {
    let cluster = ScriptedCluster::new();
    cluster.set_volumes(vec![volume("pvc-a", "node-1", 1)]);
    cluster.push_snapshot("snap-pvc-a", Ok(snapshot("snap-pvc-a", "pvc-a")));
    cluster.push_backup("backup-pvc-a", Err(not_found("Backup", "backup-pvc-a")));
    for state in [BackupState::New, BackupState::InProgress] {
        cluster.push_backup("backup-pvc-a", Ok(backup("backup-pvc-a", "pvc-a", state, "")));
    }
    cluster.push_backup(
        "backup-pvc-a",
        Ok(backup("backup-pvc-a", "pvc-a", BackupState::Completed, "")),
    );
    cluster.push_backup(
        "backup-pvc-a",
        Ok(backup("backup-pvc-a", "pvc-a", BackupState::Completed, "u1")),
    );
    let harness = Harness {
        cluster,
        storage: ScriptedStorage::new(),
    };

    let (result, artifact) = harness.run().await;
    result.expect("backup should complete");
    assert_eq!(
        harness
            .cluster
            .count(&ClusterCall::GetBackup(String::from("backup-pvc-a"))),
        5
    );
    let volume = decode(&artifact)
        .into_iter()
        .next()
        .expect("volume record")
        .into_volume()
        .expect("volume");
    assert_eq!(volume.restore_source(), Some("u1"));
}

#[tokio::test]
async fn failed_backup_aborts_without_writing() {
    let cluster = ScriptedCluster::new();
    cluster.set_volumes(vec![volume("pvc-a", "node-1", 1)]);
    cluster.push_snapshot("snap-pvc-a", Ok(snapshot("snap-pvc-a", "pvc-a")));
    cluster.push_backup(
        "backup-pvc-a",
        Ok(backup("backup-pvc-a", "pvc-a", BackupState::Error, "")),
    );
    let harness = Harness {
        cluster,
        storage: ScriptedStorage::new(),
    };

    let (result, artifact) = harness.run().await;
    let err = result.expect_err("error state is fatal");
    assert!(
        matches!(err, BackupError::BackupFailed { ref backup, ref volume, .. }
            if backup == "backup-pvc-a" && volume == "pvc-a"),
        "unexpected error: {err}"
    );
    assert!(artifact.is_empty());
}

#[rstest]
#[tokio::test]
async fn snapshot_failure_aborts_before_any_backup(two_volumes: Harness) {
    two_volumes
        .storage
        .fail_snapshot("pvc-b", rejected("snapshotCreate", "pvc-b"));

    let (result, artifact) = two_volumes.run().await;
    let err = result.expect_err("snapshot failure is fatal");
    assert!(
        matches!(err, BackupError::Snapshot { ref volume, source: StorageApiError::Protocol { .. } }
            if volume == "pvc-b"),
        "unexpected error: {err}"
    );
    assert!(
        !two_volumes
            .storage
            .calls()
            .iter()
            .any(|call| matches!(call, StorageCall::CreateBackup { .. })),
        "no backup should start after a snapshot failure"
    );
    assert!(artifact.is_empty());
}

#[tokio::test]
async fn backup_of_undiscovered_volume_is_rejected() {
    let cluster = ScriptedCluster::new();
    cluster.set_volumes(vec![volume("pvc-a", "node-1", 1)]);
    cluster.push_snapshot("snap-pvc-a", Ok(snapshot("snap-pvc-a", "pvc-a")));
    cluster.push_backup(
        "backup-pvc-a",
        Ok(backup("backup-pvc-a", "pvc-zzz", BackupState::Completed, "u1")),
    );
    let harness = Harness {
        cluster,
        storage: ScriptedStorage::new(),
    };

    let (result, _) = harness.run().await;
    let err = result.expect_err("unknown owner is fatal");
    assert!(
        matches!(err, BackupError::UnknownVolume { ref volume, .. } if volume == "pvc-zzz"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn backup_wait_times_out() {
    let cluster = ScriptedCluster::new();
    cluster.set_volumes(vec![volume("pvc-a", "node-1", 1)]);
    cluster.push_snapshot("snap-pvc-a", Ok(snapshot("snap-pvc-a", "pvc-a")));
    cluster.push_backup(
        "backup-pvc-a",
        Ok(backup("backup-pvc-a", "pvc-a", BackupState::InProgress, "")),
    );
    let harness = Harness {
        cluster,
        storage: ScriptedStorage::new(),
    };
    let policy = PollPolicy::new(Duration::from_millis(1), Duration::from_millis(20));
    let orchestrator = harness.orchestrator().with_poll_policies(PollPolicies {
        snapshot: policy,
        backup: policy,
        volume: policy,
    });

    let err = orchestrator
        .execute(Vec::new(), &CancelToken::never())
        .await
        .expect_err("wait should time out");
    assert!(
        matches!(err, BackupError::Wait(WaitError::Timeout { ref last_state, .. })
            if last_state.contains("InProgress")),
        "unexpected error: {err}"
    );
}

#[rstest]
#[tokio::test]
async fn cancelled_run_stops_before_snapshotting(two_volumes: Harness) {
    let handle = CancelHandle::new();
    handle.cancel();

    let err = two_volumes
        .orchestrator()
        .execute(Vec::new(), &handle.token())
        .await
        .expect_err("cancelled run");
    assert!(
        matches!(err, BackupError::Wait(WaitError::Cancelled { .. })),
        "unexpected error: {err}"
    );
    assert!(two_volumes.storage.calls().is_empty());
}

#[tokio::test]
async fn discovery_failure_names_the_namespace() {
    let cluster = ScriptedCluster::new();
    cluster.fail_list_volumes(longhorn_br::ClusterError::Api {
        operation: String::from("get Volume in longhorn-system"),
        status: 403,
        message: String::from("forbidden"),
    });
    let harness = Harness {
        cluster,
        storage: ScriptedStorage::new(),
    };

    let (result, _) = harness.run().await;
    let err = result.expect_err("listing failure is fatal");
    assert!(err.to_string().contains(NAMESPACE), "{err}");
}

#[tokio::test]
async fn empty_fleet_still_emits_claims() {
    let cluster = ScriptedCluster::new();
    cluster.set_claims(vec![claim("data", "apps", "pvc-a", Some(STORAGE_CLASS))]);
    let harness = Harness {
        cluster,
        storage: ScriptedStorage::new(),
    };

    let (result, artifact) = harness.run().await;
    let summary = result.expect("backup should succeed");
    assert_eq!((summary.volumes, summary.claims), (0, 1));
    assert_eq!(decode(&artifact).len(), 1);
}

#[rstest]
#[tokio::test]
async fn artifact_file_is_replaced(two_volumes: Harness) {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let dir = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
    let path = dir.join("resources.yaml");
    std::fs::write(&path, "stale: true\n---\n".repeat(50)).expect("seed artifact");

    two_volumes
        .orchestrator()
        .execute_to_path(&path, &CancelToken::never())
        .await
        .expect("backup should succeed");

    let written = std::fs::read(&path).expect("read artifact");
    let records = decode(&written);
    assert_eq!(records.len(), 4);
    assert!(!String::from_utf8_lossy(&written).contains("stale"));
}

#[rstest]
#[tokio::test]
async fn claim_listing_failure_keeps_previous_artifact(two_volumes: Harness) {
    two_volumes.cluster.fail_list_claims(ClusterError::Transport {
        operation: String::from("get PersistentVolumeClaim in all namespaces"),
        message: String::from("connection reset"),
    });
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let dir = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
    let path = dir.join("resources.yaml");
    let previous = "previous good artifact\n---\n";
    std::fs::write(&path, previous).expect("seed artifact");

    let err = two_volumes
        .orchestrator()
        .execute_to_path(&path, &CancelToken::never())
        .await
        .expect_err("claim listing failure is fatal");
    assert!(matches!(err, BackupError::ListClaims(_)), "unexpected error: {err}");
    assert_eq!(
        std::fs::read_to_string(&path).expect("read artifact"),
        previous
    );
}
