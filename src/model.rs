//! Typed views of the cluster resources the workflows read and write.
//!
//! Only the fields the workflows act on are modelled explicitly. Everything
//! else is carried through `extra` maps so a record read back from an
//! artifact reproduces the original object rather than a lossy projection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// API group and version of Longhorn custom resources.
pub const LONGHORN_API_VERSION: &str = "longhorn.io/v1beta2";

/// API version of core Kubernetes resources.
pub const CORE_API_VERSION: &str = "v1";

/// Kind discriminator of Longhorn volumes.
pub const VOLUME_KIND: &str = "Volume";

/// Kind discriminator of persistent volume claims.
pub const CLAIM_KIND: &str = "PersistentVolumeClaim";

/// Common behaviour of every typed resource.
pub trait Resource {
    /// Kind discriminator written to `kind`.
    const KIND: &'static str;
    /// Schema tag written to `apiVersion`.
    const API_VERSION: &'static str;

    /// Returns the object metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// Returns the object metadata for in-place edits.
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Stamps `apiVersion` and `kind` with the values for this type.
    ///
    /// List responses omit both on their items, so objects must be tagged
    /// before they are serialized on their own.
    fn tag(&mut self);

    /// Returns the object name.
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Returns the object namespace, or an empty string for cluster-scoped
    /// objects.
    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr, $api_version:expr) => {
        impl Resource for $ty {
            const KIND: &'static str = $kind;
            const API_VERSION: &'static str = $api_version;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn tag(&mut self) {
                self.api_version = String::from(Self::API_VERSION);
                self.kind = String::from(Self::KIND);
            }
        }
    };
}

/// Standard object metadata.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its namespace.
    #[serde(default)]
    pub name: String,
    /// Namespace; absent for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels attached to the object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations attached to the object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Server-assigned optimistic concurrency token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Server-assigned unique identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Server-assigned creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    /// Server-assigned spec generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// Field ownership bookkeeping maintained by the API server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_fields: Vec<Value>,
    /// Remaining metadata such as finalizers and owner references.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ObjectMeta {
    /// Builds metadata with a name and namespace.
    #[must_use]
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }
}

/// Volume health as reported by Longhorn.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Robustness {
    /// All replicas are healthy.
    Healthy,
    /// The volume is usable with reduced redundancy.
    Degraded,
    /// The volume is unusable.
    Faulted,
    /// Not yet reported, or a value this tool does not recognise.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A Longhorn volume.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Schema tag.
    #[serde(default)]
    pub api_version: String,
    /// Kind discriminator.
    #[serde(default)]
    pub kind: String,
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: VolumeSpec,
    /// Observed state.
    #[serde(default)]
    pub status: VolumeStatus,
}

impl_resource!(Volume, VOLUME_KIND, LONGHORN_API_VERSION);

/// Desired state of a [`Volume`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Size in bytes. Longhorn transmits this as a decimal string.
    #[serde(with = "size_string")]
    pub size: u64,
    /// Node the volume is pinned to; empty when not pinned.
    #[serde(rename = "nodeID", default)]
    pub node_id: String,
    /// Backup URL to hydrate the volume from; empty for a blank volume.
    #[serde(default)]
    pub from_backup: String,
    /// Requested replica count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_replicas: Option<u32>,
    /// Remaining spec fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Observed state of a [`Volume`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Health of the volume.
    #[serde(default)]
    pub robustness: Robustness,
    /// Attachment state (for example `attached` or `detached`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    /// Remaining status fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Volume {
    /// Builds a detached volume with the given size.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, size: u64) -> Self {
        let mut volume = Self {
            metadata: ObjectMeta::named(name, namespace),
            spec: VolumeSpec {
                size,
                ..VolumeSpec::default()
            },
            ..Self::default()
        };
        volume.tag();
        volume
    }

    /// Returns the node the volume is pinned to, if any.
    #[must_use]
    pub fn pinned_node(&self) -> Option<&str> {
        Some(self.spec.node_id.as_str()).filter(|node| !node.is_empty())
    }

    /// Returns the backup URL the volume will be hydrated from, if any.
    #[must_use]
    pub fn restore_source(&self) -> Option<&str> {
        Some(self.spec.from_backup.as_str()).filter(|url| !url.is_empty())
    }

    /// Turns the volume into a restore template: unpinned and hydrated from
    /// `backup_url`.
    pub fn point_at_backup(&mut self, backup_url: impl Into<String>) {
        self.spec.node_id.clear();
        self.spec.from_backup = backup_url.into();
    }
}

/// A Longhorn snapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Schema tag.
    #[serde(default)]
    pub api_version: String,
    /// Kind discriminator.
    #[serde(default)]
    pub kind: String,
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    #[serde(default)]
    pub spec: SnapshotSpec,
}

impl_resource!(Snapshot, "Snapshot", LONGHORN_API_VERSION);

/// Desired state of a [`Snapshot`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    /// Name of the volume the snapshot was taken from.
    #[serde(default)]
    pub volume: String,
    /// Remaining spec fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Progress of a Longhorn backup.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum BackupState {
    /// Accepted but not started.
    New,
    /// Queued behind other backups.
    Pending,
    /// Data is being uploaded.
    InProgress,
    /// The backup is durable and has a URL.
    Completed,
    /// The backup failed.
    Error,
    /// Not yet reported, or a value this tool does not recognise.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A Longhorn backup.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Schema tag.
    #[serde(default)]
    pub api_version: String,
    /// Kind discriminator.
    #[serde(default)]
    pub kind: String,
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Observed state.
    #[serde(default)]
    pub status: BackupStatus,
}

impl_resource!(Backup, "Backup", LONGHORN_API_VERSION);

/// Observed state of a [`Backup`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Progress of the backup.
    #[serde(default)]
    pub state: BackupState,
    /// Backup target URL, populated once the backup completes.
    #[serde(default)]
    pub url: String,
    /// Name of the volume the backup was taken from.
    #[serde(default)]
    pub volume_name: String,
    /// Name of the snapshot the backup was taken from.
    #[serde(default)]
    pub snapshot_name: String,
    /// Failure description when `state` is `Error`.
    #[serde(default)]
    pub error: String,
    /// Remaining status fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A persistent volume claim.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    /// Schema tag.
    #[serde(default)]
    pub api_version: String,
    /// Kind discriminator.
    #[serde(default)]
    pub kind: String,
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    #[serde(default)]
    pub spec: ClaimSpec,
    /// Observed state, carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl_resource!(PersistentVolumeClaim, CLAIM_KIND, CORE_API_VERSION);

/// Desired state of a [`PersistentVolumeClaim`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    /// Storage class the claim was provisioned with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Name of the bound volume.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_name: String,
    /// Remaining spec fields (access modes, resources, selectors).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PersistentVolumeClaim {
    /// Builds a claim bound to `volume_name` in `storage_class`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        volume_name: impl Into<String>,
        storage_class: Option<&str>,
    ) -> Self {
        let mut claim = Self {
            metadata: ObjectMeta::named(name, namespace),
            spec: ClaimSpec {
                storage_class_name: storage_class.map(str::to_owned),
                volume_name: volume_name.into(),
                extra: BTreeMap::new(),
            },
            ..Self::default()
        };
        claim.tag();
        claim
    }

    /// Returns whether the claim was provisioned with `storage_class`.
    #[must_use]
    pub fn uses_storage_class(&self, storage_class: &str) -> bool {
        self.spec.storage_class_name.as_deref() == Some(storage_class)
    }
}

/// Envelope of a list response.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct ObjectList<T> {
    #[serde(default)]
    pub(crate) items: Vec<T>,
}

mod size_string {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Number(u64),
        Text(String),
    }

    pub(super) fn serialize<S: Serializer>(size: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(size)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match RawSize::deserialize(deserializer)? {
            RawSize::Number(size) => Ok(size),
            RawSize::Text(text) => text
                .trim()
                .parse()
                .map_err(|err| D::Error::custom(format!("invalid volume size {text:?}: {err}"))),
        }
    }
}
