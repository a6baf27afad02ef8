//! Minimal Kubernetes API client for the handful of calls job execution
//! needs, plus discovery of cluster credentials.
//!
//! Credentials are looked up the way `kubectl` does for the common cases:
//! the in-cluster service account first, then a kubeconfig file. Only bearer
//! token authentication is supported.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::job::JobSpec;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("request to cluster API failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cluster API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("unexpected response from cluster API: {0}")]
    Decode(String),

    #[error("cluster configuration error: {0}")]
    Config(String),
}

/// Completion counters reported by a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub succeeded: u32,
    pub failed: u32,
}

/// The cluster operations the job runner depends on. All calls act on the
/// implementation's own namespace.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn submit_job(&self, spec: &JobSpec) -> Result<(), ClusterError>;

    async fn job_status(&self, name: &str) -> Result<JobStatus, ClusterError>;

    /// Names of pods created by job `name`.
    async fn list_pods_for_job(&self, name: &str) -> Result<Vec<String>, ClusterError>;

    async fn pod_output(&self, pod: &str) -> Result<String, ClusterError>;

    /// Delete job `name` and, in the background, its pods.
    /// Returns [`ClusterError::NotFound`] if the job is already gone.
    async fn delete_job(&self, name: &str) -> Result<(), ClusterError>;
}

// ---------------------------------------------------------------------------
// Connection discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Static(String),
    /// Re-read on every request; service account tokens are rotated.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSource {
    InCluster,
    Kubeconfig(PathBuf),
}

impl std::fmt::Display for ConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionSource::InCluster => write!(f, "in-cluster service account"),
            ConnectionSource::Kubeconfig(p) => write!(f, "kubeconfig {}", p.display()),
        }
    }
}

/// Where the API server is and how to authenticate to it.
#[derive(Debug, Clone)]
pub struct Connection {
    pub server: String,
    pub token: Option<Token>,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub source: ConnectionSource,
}

impl Connection {
    /// In-cluster configuration, or `None` when not running in a pod.
    pub fn in_cluster() -> Result<Option<Self>, ClusterError> {
        let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) else {
            return Ok(None);
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token_path = dir.join("token");
        if !token_path.exists() {
            return Err(ClusterError::Config(format!(
                "service account token missing at {}",
                token_path.display()
            )));
        }
        let ca_pem = std::fs::read(dir.join("ca.crt")).ok();

        // IPv6 service hosts need brackets.
        let host = if host.contains(':') { format!("[{}]", host) } else { host };

        Ok(Some(Self {
            server: format!("https://{}:{}", host, port),
            token: Some(Token::File(token_path)),
            ca_pem,
            insecure_skip_tls_verify: false,
            source: ConnectionSource::InCluster,
        }))
    }

    /// Connection for the current context of the kubeconfig at `path`.
    pub fn from_kubeconfig(path: &Path) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("failed to read kubeconfig {}: {}", path.display(), e))
        })?;
        let kubeconfig: KubeConfig = serde_yaml::from_str(&content).map_err(|e| {
            ClusterError::Config(format!("failed to parse kubeconfig {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        kubeconfig.resolve(base, path)
    }

    /// First available of: in-cluster credentials, then the kubeconfig at
    /// `kubeconfig`, `$KUBECONFIG`, or `$HOME/.kube/config`.
    pub fn discover(kubeconfig: Option<&Path>) -> Result<Option<Self>, ClusterError> {
        match Self::in_cluster() {
            Ok(Some(conn)) => return Ok(Some(conn)),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "in-cluster configuration unusable, falling back to kubeconfig");
            }
        }

        let candidates: Vec<PathBuf> = match kubeconfig {
            Some(p) => vec![p.to_path_buf()],
            None => {
                let mut v = Vec::new();
                if let Ok(env) = std::env::var("KUBECONFIG") {
                    v.extend(std::env::split_paths(&env).filter(|p| !p.as_os_str().is_empty()));
                }
                if let Ok(home) = std::env::var("HOME") {
                    v.push(Path::new(&home).join(".kube").join("config"));
                }
                v
            }
        };

        for path in candidates {
            if path.exists() {
                debug!(path = %path.display(), "using kubeconfig");
                return Self::from_kubeconfig(&path).map(Some);
            }
        }

        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct KubeConfig {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    #[serde(rename = "client-certificate")]
    client_certificate: Option<PathBuf>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
}

impl KubeConfig {
    fn resolve(self, base: &Path, path: &Path) -> Result<Connection, ClusterError> {
        let ctx_name = self
            .current_context
            .ok_or_else(|| ClusterError::Config("kubeconfig has no current-context".into()))?;
        let ctx = self
            .contexts
            .into_iter()
            .find(|c| c.name == ctx_name)
            .ok_or_else(|| ClusterError::Config(format!("context '{}' not defined", ctx_name)))?
            .context;
        let cluster = self
            .clusters
            .into_iter()
            .find(|c| c.name == ctx.cluster)
            .ok_or_else(|| ClusterError::Config(format!("cluster '{}' not defined", ctx.cluster)))?
            .cluster;
        let user = match &ctx.user {
            Some(name) => self
                .users
                .into_iter()
                .find(|u| &u.name == name)
                .ok_or_else(|| ClusterError::Config(format!("user '{}' not defined", name)))?
                .user,
            None => UserEntry::default(),
        };

        if cluster.certificate_authority_data.is_some() {
            return Err(ClusterError::Config(
                "embedded certificate-authority-data is not supported; reference the CA file with certificate-authority".into(),
            ));
        }
        let ca_pem = match cluster.certificate_authority {
            Some(ca) => {
                let ca = if ca.is_relative() { base.join(ca) } else { ca };
                Some(std::fs::read(&ca).map_err(|e| {
                    ClusterError::Config(format!("failed to read CA {}: {}", ca.display(), e))
                })?)
            }
            None => None,
        };

        let token = match (user.token, user.token_file) {
            (Some(t), _) => Some(Token::Static(t)),
            (None, Some(f)) => Some(Token::File(if f.is_relative() { base.join(f) } else { f })),
            (None, None) if user.client_certificate.is_some() || user.client_certificate_data.is_some() => {
                return Err(ClusterError::Config(
                    "client certificate authentication is not supported; use a bearer token".into(),
                ));
            }
            (None, None) => None,
        };

        Ok(Connection {
            server: cluster.server.trim_end_matches('/').to_string(),
            token,
            ca_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            source: ConnectionSource::Kubeconfig(path.to_path_buf()),
        })
    }
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

/// [`ClusterApi`] over the Kubernetes REST API.
pub struct KubeClient {
    http: reqwest::Client,
    server: String,
    token: Option<Token>,
    namespace: String,
}

impl KubeClient {
    pub fn new(conn: Connection, namespace: impl Into<String>, request_timeout: Duration) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder().timeout(request_timeout);
        if let Some(pem) = &conn.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        if conn.insecure_skip_tls_verify {
            warn!(server = %conn.server, "TLS verification disabled for cluster API");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let namespace = namespace.into();
        info!(server = %conn.server, source = %conn.source, %namespace, "cluster client configured");

        Ok(Self {
            http: builder.build()?,
            server: conn.server,
            token: conn.token,
            namespace,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClusterError> {
        let mut req = self.http.request(method, format!("{}{}", self.server, path));
        match &self.token {
            Some(Token::Static(t)) => req = req.bearer_auth(t),
            Some(Token::File(p)) => {
                let t = tokio::fs::read_to_string(p).await.map_err(|e| {
                    ClusterError::Config(format!("failed to read token {}: {}", p.display(), e))
                })?;
                req = req.bearer_auth(t.trim());
            }
            None => {}
        }
        Ok(req)
    }

    fn jobs_path(&self) -> String {
        format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace)
    }

    fn pods_path(&self) -> String {
        format!("/api/v1/namespaces/{}/pods", self.namespace)
    }
}

async fn send(req: RequestBuilder, resource: impl FnOnce() -> String) -> Result<Response, ClusterError> {
    let resp = req.send().await?;
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ClusterError::NotFound { resource: resource() });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClusterError::Api {
            status: status.as_u16(),
            message: status_message(&body),
        });
    }
    Ok(resp)
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClusterError> {
    resp.json::<T>()
        .await
        .map_err(|e| ClusterError::Decode(e.to_string()))
}

/// Pull `message` out of a `Status` object, else return the raw body.
fn status_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<Object>,
}

#[derive(Deserialize)]
struct Object {
    metadata: ObjectMeta,
}

#[derive(Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Deserialize)]
struct JobObject {
    status: Option<JobStatusBody>,
}

#[derive(Deserialize)]
struct JobStatusBody {
    succeeded: Option<u32>,
    failed: Option<u32>,
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn submit_job(&self, spec: &JobSpec) -> Result<(), ClusterError> {
        let req = self
            .request(Method::POST, &self.jobs_path())
            .await?
            .json(&spec.to_manifest(&self.namespace));
        send(req, || format!("namespace {}", self.namespace)).await?;
        Ok(())
    }

    async fn job_status(&self, name: &str) -> Result<JobStatus, ClusterError> {
        let path = format!("{}/{}/status", self.jobs_path(), name);
        let resp = send(self.request(Method::GET, &path).await?, || format!("job {}", name)).await?;
        let job: JobObject = decode(resp).await?;
        let status = job.status.map(|s| JobStatus {
            succeeded: s.succeeded.unwrap_or(0),
            failed: s.failed.unwrap_or(0),
        });
        Ok(status.unwrap_or_default())
    }

    async fn list_pods_for_job(&self, name: &str) -> Result<Vec<String>, ClusterError> {
        let req = self
            .request(Method::GET, &self.pods_path())
            .await?
            .query(&[("labelSelector", format!("job-name={}", name)), ("limit", "1".to_string())]);
        let resp = send(req, || format!("namespace {}", self.namespace)).await?;
        let list: ObjectList = decode(resp).await?;
        Ok(list.items.into_iter().map(|o| o.metadata.name).collect())
    }

    async fn pod_output(&self, pod: &str) -> Result<String, ClusterError> {
        let path = format!("{}/{}/log", self.pods_path(), pod);
        let resp = send(self.request(Method::GET, &path).await?, || format!("pod {}", pod)).await?;
        Ok(resp.text().await?)
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        let path = format!("{}/{}", self.jobs_path(), name);
        let req = self
            .request(Method::DELETE, &path)
            .await?
            .query(&[("propagationPolicy", "Background")]);
        send(req, || format!("job {}", name)).await?;
        Ok(())
    }
}
