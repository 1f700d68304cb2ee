//! Core library for the Longhorn backup and restore tool.
//!
//! The crate drives two remote systems: the cluster-state API, through which
//! Longhorn volumes, snapshots, backups and persistent volume claims are read
//! and created, and the Longhorn manager API, which performs snapshot, backup
//! and provisioning actions. [`BackupOrchestrator`] captures every volume into
//! a portable artifact; [`RestoreOrchestrator`] replays that artifact into a
//! cluster.

pub mod backend;
pub mod backup;
pub mod cluster;
pub mod config;
pub mod files;
pub mod kubeconfig;
pub mod model;
pub mod record;
pub mod restore;
pub mod storage;
pub mod test_support;
pub mod wait;

pub use backend::{ApiFuture, ClusterApi, ClusterError, StorageApi, StorageApiError};
pub use backup::{BackupError, BackupOrchestrator, BackupSummary};
pub use cluster::KubeClient;
pub use config::{BackupRestoreConfig, ConfigError, PollPolicies};
pub use files::FileError;
pub use kubeconfig::{ClusterCredentials, KubeconfigError};
pub use model::{
    Backup, BackupState, PersistentVolumeClaim, Resource, Robustness, Snapshot, Volume,
};
pub use record::{RecordError, RecordReader, RecordWriter, UntypedRecord};
pub use restore::{RestoreError, RestoreOrchestrator, RestoreSummary};
pub use storage::LonghornClient;
pub use wait::{CancelHandle, CancelToken, PollPolicy, Probe, WaitError, poll_until};
