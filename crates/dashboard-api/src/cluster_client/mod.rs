//! Credential-scoped cluster API clients
//!
//! [`ClusterClientFactory::build`] turns a resolved [`Credential`] into a
//! [`ClusterClient`] able to issue authenticated REST calls and open
//! long-lived watch streams. Construction never touches the network; I/O
//! happens when `request` or `open_watch` is awaited.
//!
//! # Authentication
//!
//! - Bearer credentials attach `Authorization: Bearer <token>` to every call
//!   and share one connection pool.
//! - Certificate credentials get a dedicated client carrying the identity.
//! - Impersonated identities add `Impersonate-User` / `Impersonate-Group`.
//!
//! # Dependency Injection
//!
//! Both traits are object safe and mockable so the watcher and registry can
//! be tested without a cluster.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use tracing::debug;
use zeroize::Zeroizing;

use crate::credential::{Credential, CredentialSecret, UserIdentity};
use crate::error::{Error, Result};

/// Default in-cluster API server URL
pub const DEFAULT_API_URL: &str = "https://kubernetes.default.svc";

/// Path to the in-cluster CA certificate
pub const CA_CERT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Default timeout for non-streaming requests
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Content type for request bodies
const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type for PATCH bodies
const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// Stream of raw watch response chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

// ============================================================================
// Request/Response Types
// ============================================================================

/// HTTP verb for [`ClusterClient::request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH (JSON patch)
    Patch,
    /// DELETE
    Delete,
}

impl Verb {
    fn method(self) -> reqwest::Method {
        match self {
            Verb::Get => reqwest::Method::GET,
            Verb::Post => reqwest::Method::POST,
            Verb::Put => reqwest::Method::PUT,
            Verb::Patch => reqwest::Method::PATCH,
            Verb::Delete => reqwest::Method::DELETE,
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Verb::Patch => JSON_PATCH_CONTENT_TYPE,
            _ => JSON_CONTENT_TYPE,
        }
    }
}

/// HTTP response from the cluster API (non-streaming)
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Type header value
    pub content_type: String,
    /// Response body bytes
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success response into the matching [`Error`]
    pub fn error_for_status(self, url: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::from_response(self.status, &self.body, url))
        }
    }
}

/// Query parameters of a watch request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchQuery {
    /// Continuation cursor; absent means "from now, with a synthetic list"
    pub resource_version: Option<String>,
    /// Ask the server for `BOOKMARK` frames
    pub allow_bookmarks: bool,
}

impl WatchQuery {
    /// Watch from an optional cursor with bookmarks enabled
    pub fn from_cursor(resource_version: Option<String>) -> Self {
        Self {
            resource_version,
            allow_bookmarks: true,
        }
    }

    /// Encoded query pairs, always including `watch=true`
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("watch", "true".to_string())];
        if self.allow_bookmarks {
            pairs.push(("allowWatchBookmarks", "true".to_string()));
        }
        if let Some(rv) = &self.resource_version {
            pairs.push(("resourceVersion", rv.clone()));
        }
        pairs
    }
}

// ============================================================================
// Traits for Dependency Injection
// ============================================================================

/// Authenticated access to the cluster API for one credential
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Issue a REST call against `path` (relative to the API server URL)
    async fn request(&self, verb: Verb, path: &str, body: Option<Vec<u8>>)
        -> Result<HttpResponse>;

    /// Open a watch stream on a collection path.
    ///
    /// Resolves once response headers arrive. Non-success statuses are
    /// returned as errors; dropping the stream aborts the HTTP call.
    async fn open_watch(&self, path: &str, query: &WatchQuery) -> Result<ByteStream>;
}

/// Builds [`ClusterClient`]s from credentials without performing I/O
#[cfg_attr(test, mockall::automock)]
pub trait ClusterClientFactory: Send + Sync {
    /// Build a client bound to `credential`
    fn build(&self, credential: &Credential) -> Result<Arc<dyn ClusterClient>>;
}

// ============================================================================
// Reqwest Implementation
// ============================================================================

/// Connection settings for the cluster API
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// API server base URL
    pub api_url: String,
    /// CA bundle used to verify the API server
    pub ca_cert_path: Option<PathBuf>,
    /// Skip server certificate verification (development clusters only)
    pub insecure_skip_tls_verify: bool,
    /// Timeout for non-streaming requests
    pub request_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ca_cert_path: Some(PathBuf::from(CA_CERT_PATH)),
            insecure_skip_tls_verify: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// [`ClusterClientFactory`] backed by reqwest
pub struct ReqwestClientFactory {
    api_url: String,
    request_timeout: Duration,
    root_cert: Option<reqwest::Certificate>,
    insecure_skip_tls_verify: bool,
    /// Shared pool for bearer credentials
    shared: reqwest::Client,
}

impl ReqwestClientFactory {
    /// Create a factory, loading the CA bundle if one is configured
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        let root_cert = match &config.ca_cert_path {
            Some(path) => {
                let pem = tokio::fs::read(path).await.map_err(|e| {
                    Error::Config(format!(
                        "failed to read cluster CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Config(format!("invalid cluster CA certificate: {}", e)))?;
                Some(cert)
            }
            None => None,
        };

        Self::with_root_cert(config, root_cert)
    }

    /// Create a factory with an already loaded CA certificate
    pub fn with_root_cert(
        config: ClusterConfig,
        root_cert: Option<reqwest::Certificate>,
    ) -> Result<Self> {
        let shared = client_builder(root_cert.as_ref(), config.insecure_skip_tls_verify)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
            root_cert,
            insecure_skip_tls_verify: config.insecure_skip_tls_verify,
            shared,
        })
    }
}

/// Builder with the TLS settings common to every client.
///
/// No global timeout: watch streams stay open indefinitely.
fn client_builder(
    root_cert: Option<&reqwest::Certificate>,
    insecure_skip_tls_verify: bool,
) -> reqwest::ClientBuilder {
    let mut builder = reqwest::Client::builder();
    if let Some(cert) = root_cert {
        builder = builder.add_root_certificate(cert.clone());
    }
    if insecure_skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
}

impl ClusterClientFactory for ReqwestClientFactory {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn ClusterClient>> {
        let (client, token) = match &credential.secret {
            CredentialSecret::Bearer(token) => (self.shared.clone(), Some(token.clone())),
            CredentialSecret::ClientCertificate(pem) => {
                let identity = reqwest::Identity::from_pem(pem)
                    .map_err(|e| Error::Unauthorized(format!("invalid client certificate: {}", e)))?;
                let client = client_builder(self.root_cert.as_ref(), self.insecure_skip_tls_verify)
                    .identity(identity)
                    .build()
                    .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
                (client, None)
            }
        };

        Ok(Arc::new(ReqwestClusterClient {
            client,
            api_url: self.api_url.clone(),
            token,
            impersonate: credential.impersonate.clone(),
            request_timeout: self.request_timeout,
        }))
    }
}

/// [`ClusterClient`] bound to one credential
pub struct ReqwestClusterClient {
    client: reqwest::Client,
    api_url: String,
    /// Bearer token (zeroized on drop); absent for certificate credentials
    token: Option<Zeroizing<String>>,
    impersonate: Option<UserIdentity>,
    request_timeout: Duration,
}

impl ReqwestClusterClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// Request builder with authentication and impersonation headers
    fn build_request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);

        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.as_str());
        }

        if let Some(identity) = &self.impersonate {
            builder = builder.header("Impersonate-User", &identity.username);
            for group in &identity.groups {
                builder = builder.header("Impersonate-Group", group);
            }
        }

        builder
    }
}

#[async_trait]
impl ClusterClient for ReqwestClusterClient {
    async fn request(
        &self,
        verb: Verb,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let url = self.url(path);
        debug!(verb = ?verb, url = %url, "Cluster API request");

        let mut builder = self
            .build_request(verb.method(), &url)
            .timeout(self.request_timeout);
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", verb.content_type())
                .body(body);
        }

        let response = builder.send().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("failed to reach cluster API at {}: {}", url, e))
        })?;

        let status = response.status().as_u16();
        let content_type = extract_content_type(&response);
        let body = response.bytes().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("failed to read cluster API response: {}", e))
        })?;

        Ok(HttpResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }

    async fn open_watch(&self, path: &str, query: &WatchQuery) -> Result<ByteStream> {
        let url = self.url(path);
        debug!(url = %url, resource_version = ?query.resource_version, "Opening watch");

        let response = self
            .build_request(reqwest::Method::GET, &url)
            .query(&query.pairs())
            .send()
            .await
            .map_err(|e| {
                Error::UpstreamUnavailable(format!("failed to open watch at {}: {}", url, e))
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(Error::from_response(status, &body, &url));
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| Error::UpstreamUnavailable(format!("watch stream interrupted: {}", e)));
        Ok(Box::pin(stream))
    }
}

/// Extract Content-Type header from response
fn extract_content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(JSON_CONTENT_TYPE)
        .to_string()
}
