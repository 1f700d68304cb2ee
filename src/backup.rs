//! Orchestrates point-in-time backups of every Longhorn volume.
//!
//! A run proceeds phase by phase across the whole fleet: discover the
//! volumes, snapshot each one, start a backup of each snapshot, wait for
//! every backup to complete, and finally emit the artifact. Each phase hands
//! its result to the next by value. Volumes are rewritten in memory to point
//! at their backups and are never written back to the live cluster.

use std::io::Write;

use camino::Utf8Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{ClusterApi, ClusterError, StorageApi, StorageApiError};
use crate::config::PollPolicies;
use crate::files::{self, FileError};
use crate::model::{BackupState, PersistentVolumeClaim, Resource, Volume};
use crate::record::{RecordError, RecordWriter};
use crate::wait::{CancelToken, Probe, WaitError, poll_until};

/// Errors surfaced while performing a backup run.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Raised when the volume listing fails.
    #[error("failed to list volumes in {namespace}: {source}")]
    Discover {
        /// Namespace that was listed.
        namespace: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// Raised when the storage plane refuses a snapshot.
    #[error("failed to snapshot volume {volume}: {source}")]
    Snapshot {
        /// Volume being snapshotted.
        volume: String,
        /// Underlying storage error.
        #[source]
        source: StorageApiError,
    },
    /// Raised when a snapshot lookup fails for a reason other than absence.
    #[error("failed to resolve snapshot {namespace}/{snapshot}: {source}")]
    ResolveSnapshot {
        /// Snapshot being resolved.
        snapshot: String,
        /// Namespace searched.
        namespace: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// Raised when the storage plane refuses to start a backup.
    #[error("failed to back up snapshot {snapshot} of volume {volume}: {source}")]
    StartBackup {
        /// Volume owning the snapshot.
        volume: String,
        /// Snapshot being backed up.
        snapshot: String,
        /// Underlying storage error.
        #[source]
        source: StorageApiError,
    },
    /// Raised when a backup lookup fails for a reason other than absence.
    #[error("failed to poll backup {namespace}/{backup}: {source}")]
    PollBackup {
        /// Backup being polled.
        backup: String,
        /// Namespace searched.
        namespace: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// Raised when a backup reaches the `Error` state.
    #[error("backup {backup} of volume {volume} failed: {message}")]
    BackupFailed {
        /// Failed backup.
        backup: String,
        /// Volume the backup was taken from.
        volume: String,
        /// Failure reported by Longhorn.
        message: String,
    },
    /// Raised when a completed backup names a volume this run did not
    /// discover.
    #[error("backup {backup} belongs to volume {volume}, which was not discovered in this run")]
    UnknownVolume {
        /// Completed backup.
        backup: String,
        /// Volume named by the backup.
        volume: String,
    },
    /// Raised when a wait times out or the run is cancelled.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// Raised when the claim listing fails.
    #[error("failed to list persistent volume claims: {0}")]
    ListClaims(#[source] ClusterError),
    /// Raised when a record cannot be written.
    #[error(transparent)]
    Artifact(#[from] RecordError),
    /// Raised when the artifact file cannot be opened.
    #[error(transparent)]
    File(#[from] FileError),
}

/// Counts reported by a successful backup run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BackupSummary {
    /// Volume records written.
    pub volumes: usize,
    /// Claim records written.
    pub claims: usize,
    /// Claims skipped because they use another storage class.
    pub claims_filtered: usize,
}

/// A volume and the snapshot taken of it.
#[derive(Debug)]
struct Snapshotted {
    volume: Volume,
    snapshot: String,
}

/// A volume and the backup started from its snapshot.
#[derive(Debug)]
struct BackingUp {
    volume: Volume,
    backup: String,
}

/// Completion details of one backup.
#[derive(Debug)]
struct CompletedBackup {
    url: String,
    volume_name: String,
}

/// Everything the artifact will hold: volumes rewritten to restore from
/// completed backups, in discovery order, followed by the matching claims.
#[derive(Debug)]
struct Patched {
    volumes: Vec<Volume>,
    claims: Vec<PersistentVolumeClaim>,
    claims_filtered: usize,
}

/// Executes the backup workflow against injected API clients.
#[derive(Debug)]
pub struct BackupOrchestrator<C, S> {
    cluster: C,
    storage: S,
    namespace: String,
    storage_class: String,
    policies: PollPolicies,
}

impl<C, S> BackupOrchestrator<C, S>
where
    C: ClusterApi,
    S: StorageApi,
{
    /// Creates an orchestrator managing volumes in `namespace` and claims of
    /// `storage_class`.
    #[must_use]
    pub fn new(
        cluster: C,
        storage: S,
        namespace: impl Into<String>,
        storage_class: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            storage,
            namespace: namespace.into(),
            storage_class: storage_class.into(),
            policies: PollPolicies::default(),
        }
    }

    /// Overrides the polling cadence.
    ///
    /// Tests use this to keep wait scenarios fast.
    #[must_use]
    pub const fn with_poll_policies(mut self, policies: PollPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Runs every phase and writes the artifact to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] on the first fatal failure. Nothing is
    /// written to `sink` unless every backup completed.
    pub async fn execute<W: Write>(
        &self,
        sink: W,
        cancel: &CancelToken,
    ) -> Result<BackupSummary, BackupError> {
        let patched = self.prepare(cancel).await?;
        emit(patched, sink)
    }

    /// Runs every phase and writes the artifact to `path`, replacing any
    /// previous contents. The file is only opened once every backup has
    /// completed and the claims have been listed.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] on the first fatal failure.
    pub async fn execute_to_path(
        &self,
        path: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<BackupSummary, BackupError> {
        let patched = self.prepare(cancel).await?;
        let sink = files::create_truncated(path)?;
        let summary = emit(patched, sink)?;
        info!(artifact = %path, "artifact written");
        Ok(summary)
    }

    async fn prepare(&self, cancel: &CancelToken) -> Result<Patched, BackupError> {
        let discovered = self.discover().await?;
        let snapshotted = self.snapshot(discovered, cancel).await?;
        let backing_up = self.back_up(snapshotted, cancel).await?;
        let volumes = self.await_backups(backing_up, cancel).await?;
        let (claims, claims_filtered) = self.select_claims().await?;
        Ok(Patched {
            volumes,
            claims,
            claims_filtered,
        })
    }

    async fn discover(&self) -> Result<Vec<Volume>, BackupError> {
        let volumes = self
            .cluster
            .list_volumes(&self.namespace)
            .await
            .map_err(|source| BackupError::Discover {
                namespace: self.namespace.clone(),
                source,
            })?;
        info!(
            namespace = %self.namespace,
            count = volumes.len(),
            "discovered volumes"
        );
        Ok(volumes)
    }

    async fn snapshot(
        &self,
        volumes: Vec<Volume>,
        cancel: &CancelToken,
    ) -> Result<Vec<Snapshotted>, BackupError> {
        let mut snapshotted = Vec::with_capacity(volumes.len());
        for volume in volumes {
            cancel.check("snapshot creation")?;
            let snapshot = self
                .storage
                .create_snapshot(volume.name())
                .await
                .map_err(|source| BackupError::Snapshot {
                    volume: volume.name().to_owned(),
                    source,
                })?;
            info!(volume = volume.name(), %snapshot, "snapshot created");
            snapshotted.push(Snapshotted { volume, snapshot });
        }
        Ok(snapshotted)
    }

    async fn back_up(
        &self,
        snapshotted: Vec<Snapshotted>,
        cancel: &CancelToken,
    ) -> Result<Vec<BackingUp>, BackupError> {
        let mut backing_up = Vec::with_capacity(snapshotted.len());
        for Snapshotted { volume, snapshot } in snapshotted {
            let owner = self.resolve_snapshot(&snapshot, volume.name(), cancel).await?;
            let backup = self
                .storage
                .create_backup(&owner, &snapshot)
                .await
                .map_err(|source| BackupError::StartBackup {
                    volume: owner.clone(),
                    snapshot: snapshot.clone(),
                    source,
                })?;
            info!(volume = %owner, %snapshot, %backup, "backup started");
            backing_up.push(BackingUp { volume, backup });
        }
        Ok(backing_up)
    }

    /// Waits for `snapshot` to become visible and returns its owning volume.
    async fn resolve_snapshot(
        &self,
        snapshot: &str,
        fallback_owner: &str,
        cancel: &CancelToken,
    ) -> Result<String, BackupError> {
        let cluster = &self.cluster;
        let namespace = self.namespace.as_str();
        let action = format!("snapshot {namespace}/{snapshot}");
        let found = poll_until(&self.policies.snapshot, cancel, &action, || async move {
            match cluster.get_snapshot(namespace, snapshot).await {
                Ok(found) => Ok(Probe::Ready(found)),
                Err(err) if err.is_not_found() => {
                    Ok(Probe::Pending(String::from("snapshot not visible yet")))
                }
                Err(source) => Err(BackupError::ResolveSnapshot {
                    snapshot: snapshot.to_owned(),
                    namespace: namespace.to_owned(),
                    source,
                }),
            }
        })
        .await?;

        let owner = found.spec.volume;
        if owner.is_empty() {
            debug!(%snapshot, volume = fallback_owner, "snapshot omits its volume");
            return Ok(fallback_owner.to_owned());
        }
        Ok(owner)
    }

    async fn await_backups(
        &self,
        backing_up: Vec<BackingUp>,
        cancel: &CancelToken,
    ) -> Result<Vec<Volume>, BackupError> {
        let mut volumes: Vec<Volume> = Vec::with_capacity(backing_up.len());
        let mut pending: Vec<(usize, String)> = Vec::with_capacity(backing_up.len());
        for BackingUp { volume, backup } in backing_up {
            pending.push((volumes.len(), backup));
            volumes.push(volume);
        }

        for (started_for, backup) in pending {
            let started_volume = volumes
                .get(started_for)
                .map(|volume| volume.name().to_owned())
                .unwrap_or_default();
            let completed = self.wait_for_backup(&backup, &started_volume, cancel).await?;
            let owner = if completed.volume_name.is_empty() {
                started_volume
            } else {
                completed.volume_name
            };
            let volume = volumes
                .iter_mut()
                .find(|candidate| candidate.name() == owner)
                .ok_or_else(|| BackupError::UnknownVolume {
                    backup: backup.clone(),
                    volume: owner.clone(),
                })?;
            volume.point_at_backup(&completed.url);
            info!(volume = %owner, %backup, url = %completed.url, "backup completed");
        }
        Ok(volumes)
    }

    async fn wait_for_backup(
        &self,
        backup: &str,
        volume: &str,
        cancel: &CancelToken,
    ) -> Result<CompletedBackup, BackupError> {
        let cluster = &self.cluster;
        let namespace = self.namespace.as_str();
        let action = format!("backup {namespace}/{backup}");
        poll_until(&self.policies.backup, cancel, &action, || async move {
            let found = match cluster.get_backup(namespace, backup).await {
                Ok(found) => found,
                Err(err) if err.is_not_found() => {
                    return Ok(Probe::Pending(String::from("backup not visible yet")));
                }
                Err(source) => {
                    return Err(BackupError::PollBackup {
                        backup: backup.to_owned(),
                        namespace: namespace.to_owned(),
                        source,
                    });
                }
            };
            let status = found.status;
            match status.state {
                BackupState::Completed if !status.url.is_empty() => {
                    Ok(Probe::Ready(CompletedBackup {
                        url: status.url,
                        volume_name: status.volume_name,
                    }))
                }
                BackupState::Completed => Ok(Probe::Pending(String::from(
                    "backup completed without a URL",
                ))),
                BackupState::Error => Err(BackupError::BackupFailed {
                    backup: backup.to_owned(),
                    volume: volume.to_owned(),
                    message: status.error,
                }),
                state => Ok(Probe::Pending(format!("backup state is {state:?}"))),
            }
        })
        .await
    }

    async fn select_claims(&self) -> Result<(Vec<PersistentVolumeClaim>, usize), BackupError> {
        let listed = self
            .cluster
            .list_claims()
            .await
            .map_err(BackupError::ListClaims)?;
        let total = listed.len();
        let mut claims = Vec::with_capacity(total);
        for claim in listed {
            if claim.uses_storage_class(&self.storage_class) {
                claims.push(claim);
            } else {
                debug!(
                    claim = claim.name(),
                    namespace = claim.namespace(),
                    "claim uses another storage class"
                );
            }
        }
        let filtered = total - claims.len();
        Ok((claims, filtered))
    }
}

fn emit<W: Write>(patched: Patched, sink: W) -> Result<BackupSummary, BackupError> {
    let summary = BackupSummary {
        volumes: patched.volumes.len(),
        claims: patched.claims.len(),
        claims_filtered: patched.claims_filtered,
    };
    let mut writer = RecordWriter::new(sink);
    for volume in patched.volumes {
        writer.write_record(volume)?;
    }
    for claim in patched.claims {
        writer.write_record(claim)?;
    }
    writer.finish()?;
    info!(
        volumes = summary.volumes,
        claims = summary.claims,
        "records emitted"
    );
    Ok(summary)
}
