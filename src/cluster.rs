//! Cluster-state API client speaking the Kubernetes REST protocol.

use std::time::Duration;

use camino::Utf8Path;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::{ApiFuture, ClusterApi, ClusterError};
use crate::kubeconfig::{self, ClusterCredentials};
use crate::model::{
    Backup, CLAIM_KIND, LONGHORN_API_VERSION, ObjectList, PersistentVolumeClaim, Resource,
    Snapshot, VOLUME_KIND, Volume,
};

/// Identifies the object an API call is about, for error context.
struct Target<'a> {
    kind: &'a str,
    namespace: &'a str,
    name: &'a str,
}

impl Target<'_> {
    fn describe(&self, verb: &str) -> String {
        if self.name.is_empty() {
            format!("{verb} {} in {}", self.kind, self.scope())
        } else {
            format!("{verb} {} {}/{}", self.kind, self.scope(), self.name)
        }
    }

    fn scope(&self) -> &str {
        if self.namespace.is_empty() {
            "all namespaces"
        } else {
            self.namespace
        }
    }

    fn not_found(&self) -> ClusterError {
        ClusterError::NotFound {
            kind: self.kind.to_owned(),
            namespace: self.namespace.to_owned(),
            name: self.name.to_owned(),
        }
    }

    fn already_exists(&self) -> ClusterError {
        ClusterError::AlreadyExists {
            kind: self.kind.to_owned(),
            namespace: self.namespace.to_owned(),
            name: self.name.to_owned(),
        }
    }
}

/// HTTP client for the Kubernetes API server.
#[derive(Clone, Debug)]
pub struct KubeClient {
    http: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl KubeClient {
    /// Builds a client from the current context of the kubeconfig at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] when the kubeconfig cannot be
    /// resolved or the TLS material is invalid.
    pub fn from_kubeconfig(path: &Utf8Path, timeout: Duration) -> Result<Self, ClusterError> {
        let credentials = kubeconfig::load_credentials(path)
            .map_err(|err| ClusterError::Config(err.to_string()))?;
        Self::new(credentials, timeout)
    }

    /// Builds a client from resolved credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] when the TLS material is invalid.
    pub fn new(credentials: ClusterCredentials, timeout: Duration) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(pem) = credentials.certificate_authority.as_deref() {
            let certificate = reqwest::Certificate::from_pem(pem)
                .map_err(|err| ClusterError::Config(format!("certificate authority: {err}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        if let Some(pem) = credentials.client_identity.as_deref() {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|err| ClusterError::Config(format!("client certificate: {err}")))?;
            builder = builder.identity(identity);
        }
        if credentials.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|err| ClusterError::Config(err.to_string()))?;

        Ok(Self {
            http,
            server: credentials.server,
            token: credentials.token,
        })
    }

    fn longhorn_url(&self, namespace: &str, plural: &str, name: Option<&str>) -> String {
        let collection = format!(
            "{}/apis/{LONGHORN_API_VERSION}/namespaces/{namespace}/{plural}",
            self.server
        );
        match name {
            Some(object) => format!("{collection}/{object}"),
            None => collection,
        }
    }

    fn authorised(&self, request: RequestBuilder) -> RequestBuilder {
        let Some(token) = self.token.as_deref() else {
            return request;
        };
        request.bearer_auth(token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        target: Target<'_>,
    ) -> Result<T, ClusterError> {
        let operation = target.describe("get");
        debug!(%url, "cluster GET");
        let response = self
            .authorised(self.http.get(&url))
            .send()
            .await
            .map_err(|err| ClusterError::Transport {
                operation: operation.clone(),
                message: err.to_string(),
            })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ClusterError::Transport {
                operation: operation.clone(),
                message: err.to_string(),
            })?;

        if status == StatusCode::NOT_FOUND {
            return Err(target.not_found());
        }
        if !status.is_success() {
            return Err(ClusterError::Api {
                operation,
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|err| ClusterError::Decode {
            operation,
            message: err.to_string(),
        })
    }

    async fn list<T: DeserializeOwned>(
        &self,
        url: String,
        target: Target<'_>,
    ) -> Result<Vec<T>, ClusterError> {
        let list: ObjectList<T> = self.get_json(url, target).await?;
        Ok(list.items)
    }

    async fn post_volume(&self, volume: &Volume) -> Result<(), ClusterError> {
        let target = Target {
            kind: VOLUME_KIND,
            namespace: volume.namespace(),
            name: volume.name(),
        };
        let operation = target.describe("create");
        let url = self.longhorn_url(volume.namespace(), "volumes", None);
        debug!(%url, volume = volume.name(), "cluster POST");
        let response = self
            .authorised(self.http.post(&url))
            .json(volume)
            .send()
            .await
            .map_err(|err| ClusterError::Transport {
                operation: operation.clone(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(target.already_exists());
        }
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClusterError::Api {
            operation,
            status: status.as_u16(),
            message: body,
        })
    }
}

impl ClusterApi for KubeClient {
    fn list_volumes<'a>(&'a self, namespace: &'a str) -> ApiFuture<'a, Vec<Volume>, ClusterError> {
        Box::pin(async move {
            let url = self.longhorn_url(namespace, "volumes", None);
            let target = Target {
                kind: VOLUME_KIND,
                namespace,
                name: "",
            };
            self.list(url, target).await
        })
    }

    fn list_claims(&self) -> ApiFuture<'_, Vec<PersistentVolumeClaim>, ClusterError> {
        Box::pin(async move {
            let url = format!("{}/api/v1/persistentvolumeclaims", self.server);
            let target = Target {
                kind: CLAIM_KIND,
                namespace: "",
                name: "",
            };
            self.list(url, target).await
        })
    }

    fn get_snapshot<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Snapshot, ClusterError> {
        Box::pin(async move {
            let url = self.longhorn_url(namespace, "snapshots", Some(name));
            let target = Target {
                kind: Snapshot::KIND,
                namespace,
                name,
            };
            self.get_json(url, target).await
        })
    }

    fn get_backup<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Backup, ClusterError> {
        Box::pin(async move {
            let url = self.longhorn_url(namespace, "backups", Some(name));
            let target = Target {
                kind: Backup::KIND,
                namespace,
                name,
            };
            self.get_json(url, target).await
        })
    }

    fn get_volume<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Volume, ClusterError> {
        Box::pin(async move {
            let url = self.longhorn_url(namespace, "volumes", Some(name));
            let target = Target {
                kind: VOLUME_KIND,
                namespace,
                name,
            };
            self.get_json(url, target).await
        })
    }

    fn create_volume<'a>(&'a self, volume: &'a Volume) -> ApiFuture<'a, (), ClusterError> {
        Box::pin(self.post_volume(volume))
    }
}
