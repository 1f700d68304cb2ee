//! Interfaces to the two remote systems the workflows drive.
//!
//! [`ClusterApi`] reads and creates objects through the cluster-state API;
//! [`StorageApi`] issues lifecycle actions against the Longhorn manager.
//! Orchestrators are generic over both so tests can substitute scripted
//! doubles for the HTTP clients.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::{Backup, PersistentVolumeClaim, Snapshot, Volume};

/// Future returned by API operations.
pub type ApiFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Errors raised by the cluster-state API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// The object does not exist yet. Callers polling for eventual
    /// consistency treat this as transient.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Namespace searched.
        namespace: String,
        /// Object name.
        name: String,
    },
    /// An object with the same name already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: String,
        /// Namespace of the object.
        namespace: String,
        /// Object name.
        name: String,
    },
    /// The request did not produce an HTTP response.
    #[error("cluster request to {operation} failed: {message}")]
    Transport {
        /// Operation being attempted, including the object reference.
        operation: String,
        /// Transport error message.
        message: String,
    },
    /// The API server rejected the request.
    #[error("cluster API returned HTTP {status} for {operation}: {message}")]
    Api {
        /// Operation being attempted, including the object reference.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The response body did not match the expected schema.
    #[error("cluster API response for {operation} could not be decoded: {message}")]
    Decode {
        /// Operation being attempted, including the object reference.
        operation: String,
        /// Decoder error message.
        message: String,
    },
    /// The client could not be configured.
    #[error("cluster client configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Returns whether the error reports a missing object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns whether the error reports a name collision.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Typed access to the cluster-state API.
pub trait ClusterApi {
    /// Lists Longhorn volumes in `namespace`.
    fn list_volumes<'a>(&'a self, namespace: &'a str) -> ApiFuture<'a, Vec<Volume>, ClusterError>;

    /// Lists persistent volume claims across all namespaces.
    fn list_claims(&self) -> ApiFuture<'_, Vec<PersistentVolumeClaim>, ClusterError>;

    /// Fetches a snapshot.
    fn get_snapshot<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Snapshot, ClusterError>;

    /// Fetches a backup.
    fn get_backup<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Backup, ClusterError>;

    /// Fetches a volume.
    fn get_volume<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Volume, ClusterError>;

    /// Creates a volume in its own namespace.
    fn create_volume<'a>(&'a self, volume: &'a Volume) -> ApiFuture<'a, (), ClusterError>;
}

/// Errors raised by the Longhorn manager API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageApiError {
    /// The manager could not be reached before a workflow started.
    #[error("Longhorn API at {endpoint} is unreachable: {message}")]
    Unreachable {
        /// Endpoint that was probed.
        endpoint: String,
        /// Transport error message.
        message: String,
    },
    /// The request did not produce an HTTP response.
    #[error("{action} on volume {volume} failed: {message}")]
    Transport {
        /// Longhorn action name.
        action: String,
        /// Volume the action targeted.
        volume: String,
        /// Transport error message.
        message: String,
    },
    /// The response body was not well-formed JSON.
    #[error("{action} on volume {volume} returned an undecodable body: {message}")]
    Decode {
        /// Longhorn action name.
        action: String,
        /// Volume the action targeted.
        volume: String,
        /// Decoder error message.
        message: String,
    },
    /// The response was well-formed but not what the action promises, or
    /// carried a non-success status.
    #[error("{action} on volume {volume} was rejected: {message}")]
    Protocol {
        /// Longhorn action name.
        action: String,
        /// Volume the action targeted.
        volume: String,
        /// Description of the mismatch, including the response body.
        message: String,
    },
    /// The client could not be configured.
    #[error("storage client configuration error: {0}")]
    Config(String),
}

/// Lifecycle actions exposed by the Longhorn manager.
pub trait StorageApi {
    /// Checks that the manager answers HTTP requests.
    fn probe(&self) -> ApiFuture<'_, (), StorageApiError>;

    /// Takes a snapshot of `volume` and returns the snapshot name.
    fn create_snapshot<'a>(&'a self, volume: &'a str) -> ApiFuture<'a, String, StorageApiError>;

    /// Starts a backup of `snapshot` and returns the backup identifier.
    fn create_backup<'a>(
        &'a self,
        volume: &'a str,
        snapshot: &'a str,
    ) -> ApiFuture<'a, String, StorageApiError>;

    /// Provisions the persistent volume for a restored Longhorn volume.
    fn create_volume_from_backup<'a>(
        &'a self,
        volume: &'a str,
    ) -> ApiFuture<'a, (), StorageApiError>;

    /// Provisions the claim `claim` in `namespace` bound to `volume`.
    fn create_claim<'a>(
        &'a self,
        volume: &'a str,
        claim: &'a str,
        namespace: &'a str,
    ) -> ApiFuture<'a, (), StorageApiError>;
}
