//! Longhorn manager HTTP client.
//!
//! Every lifecycle action is a `POST {endpoint}/v1/volumes/{volume}` with an
//! `action` query parameter and a small JSON body.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::backend::{ApiFuture, StorageApi, StorageApiError};

const SNAPSHOT_CREATE: &str = "snapshotCreate";
const SNAPSHOT_BACKUP: &str = "snapshotBackup";
const PV_CREATE: &str = "pvCreate";
const PVC_CREATE: &str = "pvcCreate";

#[derive(Serialize)]
struct SnapshotCreateInput {}

#[derive(Serialize)]
struct SnapshotBackupInput<'a> {
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PvCreateInput<'a> {
    pv_name: &'a str,
    fs_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PvcCreateInput<'a> {
    pvc_name: &'a str,
    namespace: &'a str,
}

#[derive(Deserialize)]
struct SnapshotCreated {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeBackupView {
    backup_status: Vec<BackupStatusEntry>,
}

#[derive(Deserialize)]
struct BackupStatusEntry {
    id: String,
    #[serde(default)]
    snapshot: String,
}

/// Client for the Longhorn manager REST API.
#[derive(Clone, Debug)]
pub struct LonghornClient {
    http: reqwest::Client,
    endpoint: String,
    fs_type: String,
}

impl LonghornClient {
    /// Creates a client for `endpoint`, provisioning persistent volumes with
    /// `fs_type`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageApiError::Config`] when the endpoint is blank or the
    /// HTTP client cannot be built.
    pub fn new(
        endpoint: &str,
        fs_type: &str,
        timeout: Duration,
    ) -> Result<Self, StorageApiError> {
        let trimmed = endpoint.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(StorageApiError::Config(String::from(
                "api endpoint must not be empty",
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StorageApiError::Config(err.to_string()))?;
        Ok(Self {
            http,
            endpoint: trimmed.to_owned(),
            fs_type: fs_type.to_owned(),
        })
    }

    /// Returns the normalised endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn volume_url(&self, volume: &str) -> String {
        format!("{}/v1/volumes/{volume}", self.endpoint)
    }

    async fn post_action<B>(
        &self,
        volume: &str,
        action: &str,
        body: &B,
    ) -> Result<(StatusCode, Vec<u8>), StorageApiError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let transport = |err: reqwest::Error| StorageApiError::Transport {
            action: action.to_owned(),
            volume: volume.to_owned(),
            message: err.to_string(),
        };
        let url = self.volume_url(volume);
        debug!(%url, action, "longhorn POST");
        let response = self
            .http
            .post(&url)
            .query(&[("action", action)])
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;
        Ok((status, bytes.to_vec()))
    }

    async fn provision<B>(&self, volume: &str, action: &str, body: &B) -> Result<(), StorageApiError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let (status, body_bytes) = self.post_action(volume, action, body).await?;
        let text = String::from_utf8_lossy(&body_bytes);
        if !status.is_success() {
            return Err(StorageApiError::Protocol {
                action: action.to_owned(),
                volume: volume.to_owned(),
                message: format!("HTTP {}: {text}", status.as_u16()),
            });
        }
        info!(volume, action, response = %text, "provisioning accepted");
        Ok(())
    }
}

fn rejected(action: &str, volume: &str, status: StatusCode, body: &[u8]) -> StorageApiError {
    StorageApiError::Protocol {
        action: action.to_owned(),
        volume: volume.to_owned(),
        message: format!(
            "HTTP {}: {}",
            status.as_u16(),
            String::from_utf8_lossy(body)
        ),
    }
}

/// Extracts the snapshot name from a `snapshotCreate` response.
pub(crate) fn snapshot_name_from_response(
    volume: &str,
    body: &[u8],
) -> Result<String, StorageApiError> {
    let created: SnapshotCreated =
        serde_json::from_slice(body).map_err(|err| StorageApiError::Decode {
            action: String::from(SNAPSHOT_CREATE),
            volume: volume.to_owned(),
            message: err.to_string(),
        })?;
    if created.name.trim().is_empty() {
        return Err(StorageApiError::Protocol {
            action: String::from(SNAPSHOT_CREATE),
            volume: volume.to_owned(),
            message: String::from("response carries an empty snapshot name"),
        });
    }
    Ok(created.name)
}

/// Extracts the backup identifier from a `snapshotBackup` response.
///
/// The response is the volume view, whose `backupStatus` list describes
/// backups in flight. The entry for `snapshot` is preferred; otherwise the
/// first entry is used.
pub(crate) fn backup_id_from_response(
    volume: &str,
    snapshot: &str,
    body: &[u8],
) -> Result<String, StorageApiError> {
    let protocol = |message: String| StorageApiError::Protocol {
        action: String::from(SNAPSHOT_BACKUP),
        volume: volume.to_owned(),
        message,
    };
    let raw: Value = serde_json::from_slice(body).map_err(|err| StorageApiError::Decode {
        action: String::from(SNAPSHOT_BACKUP),
        volume: volume.to_owned(),
        message: err.to_string(),
    })?;
    let view: VolumeBackupView = serde_json::from_value(raw)
        .map_err(|err| protocol(format!("malformed backupStatus list: {err}")))?;

    let entry = view
        .backup_status
        .iter()
        .find(|entry| entry.snapshot == snapshot)
        .or_else(|| view.backup_status.first())
        .ok_or_else(|| protocol(String::from("backupStatus list is empty")))?;
    if entry.id.trim().is_empty() {
        return Err(protocol(String::from("backupStatus entry has an empty id")));
    }
    Ok(entry.id.clone())
}

impl StorageApi for LonghornClient {
    fn probe(&self) -> ApiFuture<'_, (), StorageApiError> {
        Box::pin(async move {
            let response = self.http.get(&self.endpoint).send().await.map_err(|err| {
                StorageApiError::Unreachable {
                    endpoint: self.endpoint.clone(),
                    message: err.to_string(),
                }
            })?;
            debug!(endpoint = %self.endpoint, status = response.status().as_u16(), "probe answered");
            Ok(())
        })
    }

    fn create_snapshot<'a>(&'a self, volume: &'a str) -> ApiFuture<'a, String, StorageApiError> {
        Box::pin(async move {
            let (status, body) = self
                .post_action(volume, SNAPSHOT_CREATE, &SnapshotCreateInput {})
                .await?;
            if !status.is_success() {
                return Err(rejected(SNAPSHOT_CREATE, volume, status, &body));
            }
            snapshot_name_from_response(volume, &body)
        })
    }

    fn create_backup<'a>(
        &'a self,
        volume: &'a str,
        snapshot: &'a str,
    ) -> ApiFuture<'a, String, StorageApiError> {
        Box::pin(async move {
            let (status, body) = self
                .post_action(volume, SNAPSHOT_BACKUP, &SnapshotBackupInput { name: snapshot })
                .await?;
            if !status.is_success() {
                return Err(rejected(SNAPSHOT_BACKUP, volume, status, &body));
            }
            backup_id_from_response(volume, snapshot, &body)
        })
    }

    fn create_volume_from_backup<'a>(
        &'a self,
        volume: &'a str,
    ) -> ApiFuture<'a, (), StorageApiError> {
        Box::pin(async move {
            let body = PvCreateInput {
                pv_name: volume,
                fs_type: &self.fs_type,
            };
            self.provision(volume, PV_CREATE, &body).await
        })
    }

    fn create_claim<'a>(
        &'a self,
        volume: &'a str,
        claim: &'a str,
        namespace: &'a str,
    ) -> ApiFuture<'a, (), StorageApiError> {
        Box::pin(async move {
            let body = PvcCreateInput {
                pvc_name: claim,
                namespace,
            };
            self.provision(volume, PVC_CREATE, &body).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn snapshot_name_is_read_from_response() {
        let name = snapshot_name_from_response("pvc-1", br#"{"name":"snap-1","type":"snapshot"}"#)
            .expect("name");
        assert_eq!(name, "snap-1");
    }

    #[test]
    fn malformed_snapshot_response_is_a_decode_error() {
        let err = snapshot_name_from_response("pvc-1", b"<html>").expect_err("decode error");
        assert!(matches!(err, StorageApiError::Decode { .. }), "{err}");
    }

    #[test]
    fn backup_id_prefers_entry_for_requested_snapshot() {
        let body = br#"{"name":"pvc-1","backupStatus":[
            {"id":"backup-old","snapshot":"snap-0"},
            {"id":"backup-new","snapshot":"snap-1"}
        ]}"#;
        let id = backup_id_from_response("pvc-1", "snap-1", body).expect("id");
        assert_eq!(id, "backup-new");
    }

    #[test]
    fn backup_id_falls_back_to_first_entry() {
        let body = br#"{"backupStatus":[{"id":"backup-a"},{"id":"backup-b"}]}"#;
        let id = backup_id_from_response("pvc-1", "snap-9", body).expect("id");
        assert_eq!(id, "backup-a");
    }

    #[rstest]
    #[case::empty_list(br#"{"backupStatus":[]}"#.as_slice())]
    #[case::missing_list(br#"{"name":"pvc-1"}"#.as_slice())]
    #[case::wrong_shape(br#"{"backupStatus":{"id":"x"}}"#.as_slice())]
    #[case::blank_id(br#"{"backupStatus":[{"id":" "}]}"#.as_slice())]
    fn unusable_backup_status_is_a_protocol_error(#[case] body: &[u8]) {
        let err = backup_id_from_response("pvc-1", "snap-1", body).expect_err("protocol error");
        assert!(matches!(err, StorageApiError::Protocol { .. }), "{err}");
    }

    #[test]
    fn blank_endpoint_is_rejected() {
        let err = LonghornClient::new("  ", "ext4", Duration::from_secs(1)).expect_err("blank");
        assert!(matches!(err, StorageApiError::Config(_)));
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let client =
            LonghornClient::new("http://longhorn:9500/", "ext4", Duration::from_secs(1))
                .expect("client");
        assert_eq!(client.endpoint(), "http://longhorn:9500");
        assert_eq!(
            client.volume_url("pvc-1"),
            "http://longhorn:9500/v1/volumes/pvc-1"
        );
    }
}
