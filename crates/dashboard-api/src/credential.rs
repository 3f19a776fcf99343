//! Credential resolution for watch subscriptions
//!
//! Every SUBSCRIBE carries the caller's bearer token. [`CredentialResolver`]
//! turns it into the [`Credential`] the cluster client authenticates with.
//!
//! # Modes
//!
//! - [`ResolverMode::Passthrough`]: the user's token is used as-is. No
//!   network call is made.
//! - [`ResolverMode::Impersonate`]: the token is checked with the TokenReview
//!   API and the service credential acts as the reviewed user through
//!   `Impersonate-User` / `Impersonate-Group`.
//! - [`ResolverMode::ServiceAccount`]: the token is checked with the
//!   TokenReview API and the privileged service credential is returned.
//!
//! Nothing is cached between calls. The service credential is re-read on
//! every resolve so projected token rotation is picked up.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::cluster_client::{ClusterClientFactory, Verb};
use crate::error::{Error, Result};

/// Path to the projected service account token
pub const SA_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// TokenReview collection path
const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";

/// Authenticated user identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    /// Username (e.g. `alice` or `system:serviceaccount:ns:name`)
    pub username: String,
    /// Groups the user belongs to
    pub groups: Vec<String>,
}

/// Secret material of a credential
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSecret {
    /// Bearer token
    Bearer(Zeroizing<String>),
    /// PEM bundle holding a client certificate and its private key
    ClientCertificate(Zeroizing<Vec<u8>>),
}

impl fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSecret::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            CredentialSecret::ClientCertificate(_) => f.write_str("ClientCertificate(<redacted>)"),
        }
    }
}

/// What a cluster client authenticates with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    /// Token or client certificate
    pub secret: CredentialSecret,
    /// `exp` claim when the token is a JWT. Advisory only.
    pub expiry_hint: Option<DateTime<Utc>>,
    /// Whether this is the backend's own service credential
    pub is_privileged: bool,
    /// Identity to impersonate on every call
    pub impersonate: Option<UserIdentity>,
}

impl Credential {
    /// Unprivileged bearer credential
    pub fn bearer(token: impl Into<String>) -> Self {
        let token = Zeroizing::new(token.into());
        let expiry_hint = jwt_expiry(&token);
        Self {
            secret: CredentialSecret::Bearer(token),
            expiry_hint,
            is_privileged: false,
            impersonate: None,
        }
    }

    /// Unprivileged client certificate credential
    pub fn client_certificate(pem: Vec<u8>) -> Self {
        Self {
            secret: CredentialSecret::ClientCertificate(Zeroizing::new(pem)),
            expiry_hint: None,
            is_privileged: false,
            impersonate: None,
        }
    }

    /// Mark as the backend's own credential
    pub fn privileged(mut self) -> Self {
        self.is_privileged = true;
        self
    }

    /// Act as `identity`; the result is no longer privileged
    pub fn impersonating(mut self, identity: UserIdentity) -> Self {
        self.impersonate = Some(identity);
        self.is_privileged = false;
        self
    }

    /// Whether the expiry hint lies at or before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_hint.is_some_and(|exp| exp <= now)
    }
}

/// Strip an optional `Bearer ` prefix and reject blank or malformed tokens
pub fn normalize_token(raw: &str) -> Result<&str> {
    let trimmed = raw.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .map(str::trim)
        .unwrap_or(trimmed);

    if token.is_empty() {
        return Err(Error::Unauthorized("missing bearer token".into()));
    }
    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Unauthorized("malformed bearer token".into()));
    }
    Ok(token)
}

/// Read the `exp` claim of a JWT without verifying it
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

// ============================================================================
// Service credential
// ============================================================================

/// Source of the backend's own credential
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceCredentialSource: Send + Sync {
    /// Load the current service credential
    async fn load(&self) -> Result<Credential>;
}

/// Service credential read from disk on every load
#[derive(Clone, Debug)]
pub enum FileServiceCredential {
    /// Projected service account token
    Token(PathBuf),
    /// Client certificate + key PEM bundle
    Certificate(PathBuf),
}

impl Default for FileServiceCredential {
    fn default() -> Self {
        FileServiceCredential::Token(PathBuf::from(SA_TOKEN_PATH))
    }
}

#[async_trait]
impl ServiceCredentialSource for FileServiceCredential {
    async fn load(&self) -> Result<Credential> {
        let (path, is_token) = match self {
            FileServiceCredential::Token(path) => (path, true),
            FileServiceCredential::Certificate(path) => (path, false),
        };
        let bytes = Zeroizing::new(tokio::fs::read(path).await.map_err(|e| {
            Error::Config(format!(
                "failed to read service credential {}: {}",
                path.display(),
                e
            ))
        })?);

        if !is_token {
            return Ok(Credential::client_certificate(bytes.to_vec()).privileged());
        }

        let text = std::str::from_utf8(&bytes).map_err(|_| {
            Error::Config(format!("service token {} is not UTF-8", path.display()))
        })?;
        let token = text.trim();
        if token.is_empty() {
            return Err(Error::Config(format!(
                "service token {} is empty",
                path.display()
            )));
        }
        Ok(Credential::bearer(token).privileged())
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// How user tokens become cluster credentials
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolverMode {
    /// Use the user's token directly
    #[default]
    Passthrough,
    /// Review the token, then impersonate the user with the service credential
    Impersonate,
    /// Review the token, then use the service credential
    ServiceAccount,
}

impl FromStr for ResolverMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" => Ok(ResolverMode::Passthrough),
            "impersonate" => Ok(ResolverMode::Impersonate),
            "service-account" | "serviceaccount" => Ok(ResolverMode::ServiceAccount),
            other => Err(format!(
                "unknown credential mode '{}' (expected passthrough, impersonate or service-account)",
                other
            )),
        }
    }
}

impl fmt::Display for ResolverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolverMode::Passthrough => "passthrough",
            ResolverMode::Impersonate => "impersonate",
            ResolverMode::ServiceAccount => "service-account",
        })
    }
}

/// Submits user tokens to the TokenReview API with the service credential
struct TokenReviewer {
    service: Arc<dyn ServiceCredentialSource>,
    factory: Arc<dyn ClusterClientFactory>,
    audiences: Option<Vec<String>>,
}

impl TokenReviewer {
    async fn review(&self, service: &Credential, token: &str) -> Result<UserIdentity> {
        let client = self.factory.build(service)?;

        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };
        let body = serde_json::to_vec(&review)
            .map_err(|e| Error::Internal(format!("failed to encode TokenReview: {}", e)))?;

        let response = client
            .request(Verb::Post, TOKEN_REVIEW_PATH, Some(body))
            .await?;
        if !response.is_success() {
            return Err(
                match Error::from_response(response.status, &response.body, TOKEN_REVIEW_PATH) {
                    Error::Resource { status: 403, message } => Error::Unauthorized(message),
                    other => other,
                },
            );
        }

        let result: TokenReview = serde_json::from_slice(&response.body)
            .map_err(|e| Error::Internal(format!("invalid TokenReview response: {}", e)))?;
        let status = result
            .status
            .ok_or_else(|| Error::Internal("TokenReview returned no status".into()))?;

        validate_status(&status)
    }
}

/// Extract user identity from TokenReview status
fn validate_status(status: &TokenReviewStatus) -> Result<UserIdentity> {
    if !status.authenticated.unwrap_or(false) {
        let error_msg = status
            .error
            .as_deref()
            .unwrap_or("Token authentication failed");
        return Err(Error::Unauthorized(error_msg.to_string()));
    }

    let user = status
        .user
        .as_ref()
        .ok_or_else(|| Error::Internal("TokenReview authenticated but no user info".into()))?;

    let username = user
        .username
        .clone()
        .ok_or_else(|| Error::Internal("TokenReview user has no username".into()))?;
    let groups = user.groups.clone().unwrap_or_default();

    debug!(username = %username, groups = ?groups, "TokenReview accepted token");
    Ok(UserIdentity { username, groups })
}

/// Turns raw user tokens into [`Credential`]s
pub struct CredentialResolver {
    mode: ResolverMode,
    reviewer: Option<TokenReviewer>,
}

impl CredentialResolver {
    /// Resolver that forwards user tokens unchanged
    pub fn passthrough() -> Self {
        Self {
            mode: ResolverMode::Passthrough,
            reviewer: None,
        }
    }

    /// Resolver for `mode`.
    ///
    /// `Impersonate` and `ServiceAccount` review tokens with `service` through
    /// clients built by `factory`.
    pub fn new(
        mode: ResolverMode,
        service: Arc<dyn ServiceCredentialSource>,
        factory: Arc<dyn ClusterClientFactory>,
    ) -> Self {
        let reviewer = match mode {
            ResolverMode::Passthrough => None,
            ResolverMode::Impersonate | ResolverMode::ServiceAccount => Some(TokenReviewer {
                service,
                factory,
                audiences: None,
            }),
        };
        Self { mode, reviewer }
    }

    /// Restrict TokenReview to the given audiences
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        if let Some(reviewer) = &mut self.reviewer {
            reviewer.audiences = Some(audiences);
        }
        self
    }

    /// Configured mode
    pub fn mode(&self) -> ResolverMode {
        self.mode
    }

    /// Resolve a raw `token` (optionally `Bearer `-prefixed)
    #[instrument(skip(self, raw_token), fields(mode = %self.mode))]
    pub async fn resolve(&self, raw_token: &str) -> Result<Credential> {
        let token = normalize_token(raw_token)?;

        let reviewer = match (&self.reviewer, self.mode) {
            (_, ResolverMode::Passthrough) => {
                let credential = Credential::bearer(token);
                if credential.is_expired_at(Utc::now()) {
                    return Err(Error::Unauthorized("token expired".into()));
                }
                return Ok(credential);
            }
            (Some(reviewer), _) => reviewer,
            (None, mode) => {
                return Err(Error::Config(format!(
                    "credential mode {} has no token reviewer",
                    mode
                )))
            }
        };

        let service = reviewer.service.load().await?.privileged();
        let identity = reviewer.review(&service, token).await?;

        match self.mode {
            ResolverMode::Impersonate => Ok(service.impersonating(identity)),
            _ => {
                debug!(username = %identity.username, "Using service credential");
                Ok(service)
            }
        }
    }
}
