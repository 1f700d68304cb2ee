//! Replays an artifact into a cluster.
//!
//! Records are read and applied one at a time. Volumes are recreated from
//! their records; existing volumes are left alone so a restore can be re-run.
//! Each claim waits for its volume to report healthy before the storage
//! plane provisions the persistent volume and the claim.

use std::io::BufRead;

use camino::Utf8Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{ClusterApi, ClusterError, StorageApi, StorageApiError};
use crate::files::{self, FileError};
use crate::model::{CLAIM_KIND, PersistentVolumeClaim, Resource, Robustness, VOLUME_KIND};
use crate::record::{RecordError, RecordReader, UntypedRecord};
use crate::wait::{CancelToken, PollPolicy, Probe, WaitError, poll_until};

/// Namespace assumed for claims recorded without one.
pub const DEFAULT_CLAIM_NAMESPACE: &str = "default";

/// Errors surfaced while performing a restore run.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// Raised when the artifact cannot be read or a record cannot be decoded.
    #[error(transparent)]
    Artifact(#[from] RecordError),
    /// Raised when the artifact file cannot be opened.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when creating a volume fails for a reason other than a name
    /// collision.
    #[error("failed to create volume {namespace}/{volume}: {source}")]
    CreateVolume {
        /// Volume being created.
        volume: String,
        /// Namespace of the volume.
        namespace: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// Raised when a volume health check fails for a reason other than
    /// absence.
    #[error("failed to check volume {namespace}/{volume}: {source}")]
    CheckVolume {
        /// Volume being checked.
        volume: String,
        /// Namespace searched.
        namespace: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// Raised when a claim record names no volume.
    #[error("claim {namespace}/{claim} is not bound to a volume")]
    UnboundClaim {
        /// Claim name.
        claim: String,
        /// Claim namespace.
        namespace: String,
    },
    /// Raised when the storage plane refuses to provision a persistent
    /// volume.
    #[error("failed to provision persistent volume for {volume}: {source}")]
    ProvisionVolume {
        /// Volume being provisioned.
        volume: String,
        /// Underlying storage error.
        #[source]
        source: StorageApiError,
    },
    /// Raised when the storage plane refuses to provision a claim.
    #[error("failed to provision claim {namespace}/{claim}: {source}")]
    ProvisionClaim {
        /// Claim name.
        claim: String,
        /// Claim namespace.
        namespace: String,
        /// Underlying storage error.
        #[source]
        source: StorageApiError,
    },
    /// Raised when a wait times out or the run is cancelled.
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Counts reported by a successful restore run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RestoreSummary {
    /// Volumes created from records.
    pub volumes_created: usize,
    /// Volume records skipped because the volume already existed.
    pub volumes_skipped: usize,
    /// Claims provisioned.
    pub claims_restored: usize,
    /// Records of an unrecognised kind.
    pub records_skipped: usize,
}

/// Executes the restore workflow against injected API clients.
#[derive(Debug)]
pub struct RestoreOrchestrator<C, S> {
    cluster: C,
    storage: S,
    namespace: String,
    volume_wait: PollPolicy,
}

impl<C, S> RestoreOrchestrator<C, S>
where
    C: ClusterApi,
    S: StorageApi,
{
    /// Creates an orchestrator that looks up restored volumes in
    /// `namespace`.
    #[must_use]
    pub fn new(cluster: C, storage: S, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            storage,
            namespace: namespace.into(),
            volume_wait: crate::config::PollPolicies::default().volume,
        }
    }

    /// Overrides the volume health polling cadence.
    ///
    /// Tests use this to keep wait scenarios fast.
    #[must_use]
    pub const fn with_volume_wait(mut self, policy: PollPolicy) -> Self {
        self.volume_wait = policy;
        self
    }

    /// Applies every record read from `source`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`RestoreError`] on the first fatal failure. Records applied
    /// before the failure stay applied.
    pub async fn execute<R: BufRead>(
        &self,
        source: R,
        cancel: &CancelToken,
    ) -> Result<RestoreSummary, RestoreError> {
        let mut summary = RestoreSummary::default();
        for record in RecordReader::new(source) {
            let record = record?;
            cancel.check("restore")?;
            let kind = record.kind().to_owned();
            match kind.as_str() {
                VOLUME_KIND => self.restore_volume(record, &mut summary).await?,
                CLAIM_KIND => self.restore_claim(record, cancel, &mut summary).await?,
                other => {
                    warn!(
                        kind = other,
                        name = record.name(),
                        index = record.index(),
                        "skipping record of unsupported kind"
                    );
                    summary.records_skipped += 1;
                }
            }
        }
        info!(
            volumes_created = summary.volumes_created,
            volumes_skipped = summary.volumes_skipped,
            claims = summary.claims_restored,
            "restore finished"
        );
        Ok(summary)
    }

    /// Applies every record in the artifact at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RestoreError`] when the file cannot be opened or a record
    /// fails to apply.
    pub async fn execute_from_path(
        &self,
        path: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<RestoreSummary, RestoreError> {
        let source = files::open_buffered(path)?;
        info!(artifact = %path, "replaying artifact");
        self.execute(source, cancel).await
    }

    async fn restore_volume(
        &self,
        record: UntypedRecord,
        summary: &mut RestoreSummary,
    ) -> Result<(), RestoreError> {
        let mut volume = record.into_volume()?;
        if volume.metadata.namespace.is_none() {
            volume.metadata.namespace = Some(self.namespace.clone());
        }
        match self.cluster.create_volume(&volume).await {
            Ok(()) => {
                info!(
                    volume = volume.name(),
                    namespace = volume.namespace(),
                    source = volume.restore_source().unwrap_or_default(),
                    "volume created"
                );
                summary.volumes_created += 1;
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                info!(
                    volume = volume.name(),
                    namespace = volume.namespace(),
                    "volume already exists; skipping"
                );
                summary.volumes_skipped += 1;
                Ok(())
            }
            Err(source) => Err(RestoreError::CreateVolume {
                volume: volume.name().to_owned(),
                namespace: volume.namespace().to_owned(),
                source,
            }),
        }
    }

    async fn restore_claim(
        &self,
        record: UntypedRecord,
        cancel: &CancelToken,
        summary: &mut RestoreSummary,
    ) -> Result<(), RestoreError> {
        let claim = record.into_claim()?;
        let namespace = claim_namespace(&claim);
        let volume = claim.spec.volume_name.as_str();
        if volume.is_empty() {
            return Err(RestoreError::UnboundClaim {
                claim: claim.name().to_owned(),
                namespace: namespace.to_owned(),
            });
        }

        self.wait_until_healthy(volume, cancel).await?;

        self.storage
            .create_volume_from_backup(volume)
            .await
            .map_err(|source| RestoreError::ProvisionVolume {
                volume: volume.to_owned(),
                source,
            })?;
        self.storage
            .create_claim(volume, claim.name(), namespace)
            .await
            .map_err(|source| RestoreError::ProvisionClaim {
                claim: claim.name().to_owned(),
                namespace: namespace.to_owned(),
                source,
            })?;
        info!(claim = claim.name(), namespace, volume, "claim restored");
        summary.claims_restored += 1;
        Ok(())
    }

    async fn wait_until_healthy(
        &self,
        volume: &str,
        cancel: &CancelToken,
    ) -> Result<(), RestoreError> {
        let cluster = &self.cluster;
        let namespace = self.namespace.as_str();
        let action = format!("volume {namespace}/{volume} to become healthy");
        poll_until(&self.volume_wait, cancel, &action, || async move {
            match cluster.get_volume(namespace, volume).await {
                Ok(found) if found.status.robustness == Robustness::Healthy => {
                    Ok(Probe::Ready(()))
                }
                Ok(found) => Ok(Probe::Pending(format!(
                    "robustness is {:?}",
                    found.status.robustness
                ))),
                Err(err) if err.is_not_found() => {
                    Ok(Probe::Pending(String::from("volume not visible yet")))
                }
                Err(source) => Err(RestoreError::CheckVolume {
                    volume: volume.to_owned(),
                    namespace: namespace.to_owned(),
                    source,
                }),
            }
        })
        .await
    }
}

fn claim_namespace(claim: &PersistentVolumeClaim) -> &str {
    claim
        .metadata
        .namespace
        .as_deref()
        .filter(|namespace| !namespace.is_empty())
        .unwrap_or(DEFAULT_CLAIM_NAMESPACE)
}
