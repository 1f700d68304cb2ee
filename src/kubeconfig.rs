//! Minimal kubeconfig reader.
//!
//! Resolves the current context of a kubeconfig file into the server URL,
//! trust anchors and credentials needed to talk to the cluster-state API.
//! Exec plugins and auth providers are not supported.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

use crate::files::{self, FileError};

/// Connection details for the current kubeconfig context.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterCredentials {
    /// API server base URL.
    pub server: String,
    /// PEM bundle used to verify the API server.
    pub certificate_authority: Option<Vec<u8>>,
    /// Disables server certificate verification.
    pub insecure_skip_tls_verify: bool,
    /// Bearer token.
    pub token: Option<String>,
    /// PEM client certificate followed by its private key.
    pub client_identity: Option<Vec<u8>>,
}

/// Errors raised while resolving kubeconfig credentials.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KubeconfigError {
    /// Raised when a referenced file cannot be read.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when the kubeconfig is not valid YAML.
    #[error("failed to parse kubeconfig {path}: {message}")]
    Parse {
        /// Kubeconfig path.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when no context is selected or the selected one is absent.
    #[error("kubeconfig has no context named {0:?}")]
    MissingContext(String),
    /// Raised when the context refers to an unknown cluster.
    #[error("kubeconfig has no cluster named {0:?}")]
    MissingCluster(String),
    /// Raised when the context refers to an unknown user.
    #[error("kubeconfig has no user named {0:?}")]
    MissingUser(String),
    /// Raised when inline base64 data cannot be decoded.
    #[error("kubeconfig field {field} is not valid base64: {message}")]
    Decode {
        /// Field holding the data.
        field: &'static str,
        /// Decoder error message.
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigFile {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    current_context: String,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<Utf8PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<Utf8PathBuf>,
    #[serde(default)]
    client_certificate: Option<Utf8PathBuf>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<Utf8PathBuf>,
    #[serde(default)]
    client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: String,
}

/// Loads the kubeconfig at `path` and resolves its current context.
///
/// # Errors
///
/// Returns [`KubeconfigError`] when the file cannot be read or does not
/// describe a usable context.
pub fn load_credentials(path: &Utf8Path) -> Result<ClusterCredentials, KubeconfigError> {
    let contents = files::read_to_string(path)?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    parse(&contents, path, base_dir)
}

/// Parses kubeconfig `contents`, resolving relative file references against
/// `base_dir`.
///
/// # Errors
///
/// Returns [`KubeconfigError`] when the contents do not describe a usable
/// context.
pub fn parse_credentials(
    contents: &str,
    base_dir: &Utf8Path,
) -> Result<ClusterCredentials, KubeconfigError> {
    parse(contents, base_dir, base_dir)
}

fn parse(
    contents: &str,
    origin: &Utf8Path,
    base_dir: &Utf8Path,
) -> Result<ClusterCredentials, KubeconfigError> {
    let parsed: KubeconfigFile =
        serde_yaml::from_str(contents).map_err(|err| KubeconfigError::Parse {
            path: origin.to_path_buf(),
            message: err.to_string(),
        })?;
    resolve(&parsed, base_dir)
}

fn resolve(
    config: &KubeconfigFile,
    base_dir: &Utf8Path,
) -> Result<ClusterCredentials, KubeconfigError> {
    let context = config
        .contexts
        .iter()
        .find(|candidate| candidate.name == config.current_context)
        .map(|named| &named.context)
        .ok_or_else(|| KubeconfigError::MissingContext(config.current_context.clone()))?;

    let cluster = config
        .clusters
        .iter()
        .find(|candidate| candidate.name == context.cluster)
        .map(|named| &named.cluster)
        .ok_or_else(|| KubeconfigError::MissingCluster(context.cluster.clone()))?;

    let user = if context.user.is_empty() {
        None
    } else {
        let found = config
            .users
            .iter()
            .find(|candidate| candidate.name == context.user)
            .map(|named| &named.user)
            .ok_or_else(|| KubeconfigError::MissingUser(context.user.clone()))?;
        Some(found)
    };

    let certificate_authority = inline_or_file(
        "certificate-authority-data",
        cluster.certificate_authority_data.as_deref(),
        cluster.certificate_authority.as_deref(),
        base_dir,
    )?;

    let (token, client_identity) = match user {
        Some(entry) => (resolve_token(entry, base_dir)?, resolve_identity(entry, base_dir)?),
        None => (None, None),
    };

    Ok(ClusterCredentials {
        server: cluster.server.trim_end_matches('/').to_owned(),
        certificate_authority,
        insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        token,
        client_identity,
    })
}

fn resolve_token(user: &UserEntry, base_dir: &Utf8Path) -> Result<Option<String>, KubeconfigError> {
    if let Some(token) = user.token.as_deref().filter(|token| !token.is_empty()) {
        return Ok(Some(token.to_owned()));
    }
    let Some(token_file) = user.token_file.as_deref() else {
        return Ok(None);
    };
    let contents = files::read_to_string(&base_dir.join(token_file))?;
    Ok(Some(contents.trim().to_owned()))
}

fn resolve_identity(
    user: &UserEntry,
    base_dir: &Utf8Path,
) -> Result<Option<Vec<u8>>, KubeconfigError> {
    let certificate = inline_or_file(
        "client-certificate-data",
        user.client_certificate_data.as_deref(),
        user.client_certificate.as_deref(),
        base_dir,
    )?;
    let key = inline_or_file(
        "client-key-data",
        user.client_key_data.as_deref(),
        user.client_key.as_deref(),
        base_dir,
    )?;
    Ok(match (certificate, key) {
        (Some(mut pem), Some(key_pem)) => {
            if !pem.ends_with(b"\n") {
                pem.push(b'\n');
            }
            pem.extend_from_slice(&key_pem);
            Some(pem)
        }
        _ => None,
    })
}

fn inline_or_file(
    field: &'static str,
    inline: Option<&str>,
    file: Option<&Utf8Path>,
    base_dir: &Utf8Path,
) -> Result<Option<Vec<u8>>, KubeconfigError> {
    if let Some(data) = inline.filter(|data| !data.trim().is_empty()) {
        let decoded = STANDARD
            .decode(data.trim())
            .map_err(|err| KubeconfigError::Decode {
                field,
                message: err.to_string(),
            })?;
        return Ok(Some(decoded));
    }
    let Some(relative) = file else {
        return Ok(None);
    };
    Ok(Some(files::read(&base_dir.join(relative))?))
}
