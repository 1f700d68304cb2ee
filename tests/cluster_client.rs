//! Wire-level tests for the cluster-state client against a local HTTP
//! responder.

use std::time::Duration;

#[path = "common/responder.rs"]
mod responder;

use longhorn_br::test_support::{NAMESPACE, volume};
use longhorn_br::{ClusterApi, ClusterCredentials, ClusterError, KubeClient};
use responder::respond_once;

fn client(endpoint: &str) -> KubeClient {
    KubeClient::new(
        ClusterCredentials {
            server: endpoint.to_owned(),
            token: Some(String::from("cluster-token")),
            ..ClusterCredentials::default()
        },
        Duration::from_secs(5),
    )
    .expect("client")
}

#[tokio::test]
async fn missing_object_is_not_found() {
    let (endpoint, server) =
        respond_once("404 Not Found", r#"{"kind":"Status","reason":"NotFound"}"#).await;

    let err = client(&endpoint)
        .get_volume(NAMESPACE, "pvc-a")
        .await
        .expect_err("absent volume");
    assert_eq!(
        err,
        ClusterError::NotFound {
            kind: String::from("Volume"),
            namespace: String::from(NAMESPACE),
            name: String::from("pvc-a"),
        }
    );
    assert!(err.is_not_found());

    let captured = server.await.expect("responder");
    assert!(
        captured
            .head
            .starts_with("GET /apis/longhorn.io/v1beta2/namespaces/longhorn-system/volumes/pvc-a "),
        "{}",
        captured.head
    );
    assert!(
        captured
            .head
            .to_ascii_lowercase()
            .contains("authorization: bearer cluster-token"),
        "{}",
        captured.head
    );
}

#[tokio::test]
async fn name_collision_is_already_exists() {
    let (endpoint, server) =
        respond_once("409 Conflict", r#"{"kind":"Status","reason":"AlreadyExists"}"#).await;

    let err = client(&endpoint)
        .create_volume(&volume("pvc-a", "", 1_073_741_824))
        .await
        .expect_err("collision");
    assert!(err.is_already_exists(), "{err}");

    let captured = server.await.expect("responder");
    assert!(
        captured
            .head
            .starts_with("POST /apis/longhorn.io/v1beta2/namespaces/longhorn-system/volumes "),
        "{}",
        captured.head
    );
    assert!(captured.body.contains(r#""name":"pvc-a""#), "{}", captured.body);
}

#[tokio::test]
async fn server_failure_is_an_api_error() {
    let (endpoint, server) = respond_once("500 Internal Server Error", "etcd unavailable").await;

    let err = client(&endpoint)
        .create_volume(&volume("pvc-a", "", 1_073_741_824))
        .await
        .expect_err("server failure");
    assert!(
        matches!(err, ClusterError::Api { status: 500, ref message, .. } if message == "etcd unavailable"),
        "{err}"
    );
    server.await.expect("responder");
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let (endpoint, server) = respond_once("200 OK", "<html>proxy error</html>").await;

    let err = client(&endpoint)
        .get_backup(NAMESPACE, "backup-a")
        .await
        .expect_err("undecodable");
    assert!(
        matches!(err, ClusterError::Decode { ref operation, .. } if operation.contains("backup-a")),
        "{err}"
    );
    server.await.expect("responder");
}

#[tokio::test]
async fn volume_listing_normalises_string_sizes() {
    let (endpoint, server) = respond_once(
        "200 OK",
        r#"{"items":[{"apiVersion":"longhorn.io/v1beta2","kind":"Volume","metadata":{"name":"pvc-a","namespace":"longhorn-system"},"spec":{"size":"1073741824","nodeID":"node-1"}}]}"#,
    )
    .await;

    let volumes = client(&endpoint)
        .list_volumes(NAMESPACE)
        .await
        .expect("listing");
    let summary: Vec<(&str, u64, Option<&str>)> = volumes
        .iter()
        .map(|found| (found.metadata.name.as_str(), found.spec.size, found.pinned_node()))
        .collect();
    assert_eq!(summary, vec![("pvc-a", 1_073_741_824, Some("node-1"))]);
    server.await.expect("responder");
}
