//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedCluster`] and [`ScriptedStorage`] stand in for the HTTP clients.
//! Point lookups answer from per-name scripts: each call consumes the front
//! response until one remains, which then repeats. Every call is recorded so
//! tests can assert on ordering.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::backend::{ApiFuture, ClusterApi, ClusterError, StorageApi, StorageApiError};
use crate::model::{
    Backup, BackupState, BackupStatus, ObjectMeta, PersistentVolumeClaim, Robustness, Snapshot,
    SnapshotSpec, Volume,
};

/// Namespace used by the fixtures.
pub const NAMESPACE: &str = "longhorn-system";

/// Storage class used by the fixtures.
pub const STORAGE_CLASS: &str = "longhorn";

/// Builds a volume of `size` bytes pinned to `node`.
#[must_use]
pub fn volume(name: &str, node: &str, size: u64) -> Volume {
    let mut volume = Volume::new(name, NAMESPACE, size);
    volume.spec.node_id = node.to_owned();
    volume.metadata.resource_version = Some(String::from("1001"));
    volume
}

/// Builds a volume reporting `robustness`.
#[must_use]
pub fn volume_with_health(name: &str, robustness: Robustness) -> Volume {
    let mut volume = Volume::new(name, NAMESPACE, 1);
    volume.status.robustness = robustness;
    volume
}

/// Builds a snapshot of `volume`.
#[must_use]
pub fn snapshot(name: &str, volume: &str) -> Snapshot {
    Snapshot {
        metadata: ObjectMeta::named(name, NAMESPACE),
        spec: SnapshotSpec {
            volume: volume.to_owned(),
            ..SnapshotSpec::default()
        },
        ..Snapshot::default()
    }
}

/// Builds a backup of `volume` in `state` with `url`.
#[must_use]
pub fn backup(name: &str, volume: &str, state: BackupState, url: &str) -> Backup {
    Backup {
        metadata: ObjectMeta::named(name, NAMESPACE),
        status: BackupStatus {
            state,
            url: url.to_owned(),
            volume_name: volume.to_owned(),
            ..BackupStatus::default()
        },
        ..Backup::default()
    }
}

/// Builds a claim bound to `volume`, without `apiVersion` and `kind` as in
/// list responses.
#[must_use]
pub fn claim(name: &str, namespace: &str, volume: &str, class: Option<&str>) -> PersistentVolumeClaim {
    let mut claim = PersistentVolumeClaim::new(name, namespace, volume, class);
    claim.api_version.clear();
    claim.kind.clear();
    claim
}

/// Builds the not-found error the cluster API reports for `kind`.
#[must_use]
pub fn not_found(kind: &str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: kind.to_owned(),
        namespace: String::from(NAMESPACE),
        name: name.to_owned(),
    }
}

/// Builds a rejection the storage API reports for `action`.
#[must_use]
pub fn rejected(action: &str, volume: &str) -> StorageApiError {
    StorageApiError::Protocol {
        action: action.to_owned(),
        volume: volume.to_owned(),
        message: String::from("HTTP 500: simulated failure"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-name responses where the last entry repeats.
#[derive(Debug)]
struct Script<T> {
    responses: BTreeMap<String, VecDeque<T>>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            responses: BTreeMap::new(),
        }
    }
}

impl<T: Clone> Script<T> {
    fn push(&mut self, name: &str, response: T) {
        self.responses
            .entry(name.to_owned())
            .or_default()
            .push_back(response);
    }

    fn next(&mut self, name: &str) -> Option<T> {
        let queue = self.responses.get_mut(name)?;
        if queue.len() > 1 {
            return queue.pop_front();
        }
        queue.front().cloned()
    }
}

/// Records one call made through [`ScriptedCluster`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterCall {
    /// `list_volumes` in a namespace.
    ListVolumes(String),
    /// `list_claims`.
    ListClaims,
    /// `get_snapshot` by name.
    GetSnapshot(String),
    /// `get_backup` by name.
    GetBackup(String),
    /// `get_volume` by name.
    GetVolume(String),
    /// `create_volume` by name.
    CreateVolume(String),
}

#[derive(Debug, Default)]
struct ClusterState {
    volumes: Vec<Volume>,
    claims: Vec<PersistentVolumeClaim>,
    list_volumes_error: Option<ClusterError>,
    list_claims_error: Option<ClusterError>,
    snapshots: Script<Result<Snapshot, ClusterError>>,
    backups: Script<Result<Backup, ClusterError>>,
    volume_lookups: Script<Result<Volume, ClusterError>>,
    creations: Script<Result<(), ClusterError>>,
    created: Vec<Volume>,
    calls: Vec<ClusterCall>,
}

/// Scripted cluster-state API.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl ScriptedCluster {
    /// Creates a cluster with no objects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the volumes returned by `list_volumes`.
    pub fn set_volumes(&self, volumes: Vec<Volume>) {
        lock(&self.state).volumes = volumes;
    }

    /// Makes `list_volumes` fail.
    pub fn fail_list_volumes(&self, error: ClusterError) {
        lock(&self.state).list_volumes_error = Some(error);
    }

    /// Sets the claims returned by `list_claims`.
    pub fn set_claims(&self, claims: Vec<PersistentVolumeClaim>) {
        lock(&self.state).claims = claims;
    }

    /// Makes `list_claims` fail.
    pub fn fail_list_claims(&self, error: ClusterError) {
        lock(&self.state).list_claims_error = Some(error);
    }

    /// Queues a `get_snapshot` response for `name`.
    pub fn push_snapshot(&self, name: &str, response: Result<Snapshot, ClusterError>) {
        lock(&self.state).snapshots.push(name, response);
    }

    /// Queues a `get_backup` response for `name`.
    pub fn push_backup(&self, name: &str, response: Result<Backup, ClusterError>) {
        lock(&self.state).backups.push(name, response);
    }

    /// Queues a `get_volume` response for `name`.
    pub fn push_volume_lookup(&self, name: &str, response: Result<Volume, ClusterError>) {
        lock(&self.state).volume_lookups.push(name, response);
    }

    /// Queues a `create_volume` response for `name`. Unscripted creations
    /// succeed.
    pub fn push_creation(&self, name: &str, response: Result<(), ClusterError>) {
        lock(&self.state).creations.push(name, response);
    }

    /// Returns every volume passed to `create_volume`.
    #[must_use]
    pub fn created_volumes(&self) -> Vec<Volume> {
        lock(&self.state).created.clone()
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ClusterCall> {
        lock(&self.state).calls.clone()
    }

    /// Counts calls equal to `call`.
    #[must_use]
    pub fn count(&self, call: &ClusterCall) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|made| *made == call)
            .count()
    }
}

impl ClusterApi for ScriptedCluster {
    fn list_volumes<'a>(&'a self, namespace: &'a str) -> ApiFuture<'a, Vec<Volume>, ClusterError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::ListVolumes(namespace.to_owned()));
        let result = match state.list_volumes_error.clone() {
            Some(error) => Err(error),
            None => Ok(state.volumes.clone()),
        };
        Box::pin(future::ready(result))
    }

    fn list_claims(&self) -> ApiFuture<'_, Vec<PersistentVolumeClaim>, ClusterError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::ListClaims);
        let result = match state.list_claims_error.clone() {
            Some(error) => Err(error),
            None => Ok(state.claims.clone()),
        };
        Box::pin(future::ready(result))
    }

    fn get_snapshot<'a>(
        &'a self,
        _namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Snapshot, ClusterError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::GetSnapshot(name.to_owned()));
        let result = state
            .snapshots
            .next(name)
            .unwrap_or_else(|| Err(not_found("Snapshot", name)));
        Box::pin(future::ready(result))
    }

    fn get_backup<'a>(
        &'a self,
        _namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Backup, ClusterError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::GetBackup(name.to_owned()));
        let result = state
            .backups
            .next(name)
            .unwrap_or_else(|| Err(not_found("Backup", name)));
        Box::pin(future::ready(result))
    }

    fn get_volume<'a>(
        &'a self,
        _namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Volume, ClusterError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::GetVolume(name.to_owned()));
        let result = state
            .volume_lookups
            .next(name)
            .unwrap_or_else(|| Err(not_found("Volume", name)));
        Box::pin(future::ready(result))
    }

    fn create_volume<'a>(&'a self, volume: &'a Volume) -> ApiFuture<'a, (), ClusterError> {
        let mut state = lock(&self.state);
        let name = volume.metadata.name.clone();
        state.calls.push(ClusterCall::CreateVolume(name.clone()));
        let result = state.creations.next(&name).unwrap_or(Ok(()));
        if result.is_ok() {
            state.created.push(volume.clone());
        }
        Box::pin(future::ready(result))
    }
}

/// Records one call made through [`ScriptedStorage`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StorageCall {
    /// Reachability probe.
    Probe,
    /// `snapshotCreate` for a volume.
    CreateSnapshot(String),
    /// `snapshotBackup` for a volume and snapshot.
    CreateBackup {
        /// Volume owning the snapshot.
        volume: String,
        /// Snapshot being backed up.
        snapshot: String,
    },
    /// `pvCreate` for a volume.
    CreatePersistentVolume(String),
    /// `pvcCreate` for a claim.
    CreateClaim {
        /// Bound volume.
        volume: String,
        /// Claim name.
        claim: String,
        /// Claim namespace.
        namespace: String,
    },
}

#[derive(Debug, Default)]
struct StorageState {
    snapshot_errors: BTreeMap<String, StorageApiError>,
    backup_ids: BTreeMap<String, String>,
    backup_errors: BTreeMap<String, StorageApiError>,
    provision_errors: BTreeMap<String, StorageApiError>,
    claim_errors: BTreeMap<String, StorageApiError>,
    calls: Vec<StorageCall>,
}

/// Scripted Longhorn manager API.
///
/// Snapshots are named `snap-{volume}` and backups `backup-{volume}` unless
/// overridden.
#[derive(Clone, Debug, Default)]
pub struct ScriptedStorage {
    state: Arc<Mutex<StorageState>>,
}

impl ScriptedStorage {
    /// Creates a storage API that accepts every action.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create_snapshot` fail for `volume`.
    pub fn fail_snapshot(&self, volume: &str, error: StorageApiError) {
        lock(&self.state)
            .snapshot_errors
            .insert(volume.to_owned(), error);
    }

    /// Overrides the backup identifier returned for `snapshot`.
    pub fn set_backup_id(&self, snapshot: &str, backup: &str) {
        lock(&self.state)
            .backup_ids
            .insert(snapshot.to_owned(), backup.to_owned());
    }

    /// Makes `create_backup` fail for `snapshot`.
    pub fn fail_backup(&self, snapshot: &str, error: StorageApiError) {
        lock(&self.state)
            .backup_errors
            .insert(snapshot.to_owned(), error);
    }

    /// Makes `create_volume_from_backup` fail for `volume`.
    pub fn fail_provision(&self, volume: &str, error: StorageApiError) {
        lock(&self.state)
            .provision_errors
            .insert(volume.to_owned(), error);
    }

    /// Makes `create_claim` fail for `claim`.
    pub fn fail_claim(&self, claim: &str, error: StorageApiError) {
        lock(&self.state)
            .claim_errors
            .insert(claim.to_owned(), error);
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<StorageCall> {
        lock(&self.state).calls.clone()
    }
}

impl StorageApi for ScriptedStorage {
    fn probe(&self) -> ApiFuture<'_, (), StorageApiError> {
        let mut state = lock(&self.state);
        state.calls.push(StorageCall::Probe);
        Box::pin(future::ready(Ok(())))
    }

    fn create_snapshot<'a>(&'a self, volume: &'a str) -> ApiFuture<'a, String, StorageApiError> {
        let mut state = lock(&self.state);
        state.calls.push(StorageCall::CreateSnapshot(volume.to_owned()));
        let result = match state.snapshot_errors.get(volume) {
            Some(error) => Err(error.clone()),
            None => Ok(format!("snap-{volume}")),
        };
        Box::pin(future::ready(result))
    }

    fn create_backup<'a>(
        &'a self,
        volume: &'a str,
        snapshot: &'a str,
    ) -> ApiFuture<'a, String, StorageApiError> {
        let mut state = lock(&self.state);
        state.calls.push(StorageCall::CreateBackup {
            volume: volume.to_owned(),
            snapshot: snapshot.to_owned(),
        });
        let result = match state.backup_errors.get(snapshot) {
            Some(error) => Err(error.clone()),
            None => Ok(state
                .backup_ids
                .get(snapshot)
                .cloned()
                .unwrap_or_else(|| format!("backup-{volume}"))),
        };
        Box::pin(future::ready(result))
    }

    fn create_volume_from_backup<'a>(
        &'a self,
        volume: &'a str,
    ) -> ApiFuture<'a, (), StorageApiError> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(StorageCall::CreatePersistentVolume(volume.to_owned()));
        let result = state.provision_errors.get(volume).cloned().map_or(Ok(()), Err);
        Box::pin(future::ready(result))
    }

    fn create_claim<'a>(
        &'a self,
        volume: &'a str,
        claim: &'a str,
        namespace: &'a str,
    ) -> ApiFuture<'a, (), StorageApiError> {
        let mut state = lock(&self.state);
        state.calls.push(StorageCall::CreateClaim {
            volume: volume.to_owned(),
            claim: claim.to_owned(),
            namespace: namespace.to_owned(),
        });
        let result = state.claim_errors.get(claim).cloned().map_or(Ok(()), Err);
        Box::pin(future::ready(result))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
