//! Dashboard watch bridge
//!
//! Relays Kubernetes watch streams for DevWorkspaces (and a few related
//! kinds) to browser dashboards. Each browser tab holds one websocket and
//! multiplexes any number of named channels over it; every channel is backed
//! by an upstream watch opened with the caller's own credential.
//!
//! # Architecture
//!
//! ```text
//! browser ──ws──► gateway ──► SubscriptionRegistry ──► ResourceWatcher ──► K8s API
//!                    ▲                                        │
//!                    └──────────── WatcherMessage ◄───────────┘
//! ```
//!
//! # Endpoints
//!
//! - `GET /dashboard/api/websocket` - Channel multiplexed watch stream
//! - `GET /healthz` - Health check

#![deny(missing_docs)]

pub mod cluster_client;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod resource;
pub mod server;
pub mod subscription;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use cluster_client::{
    ClusterClient, ClusterClientFactory, ClusterConfig, ReqwestClientFactory, WatchQuery,
};
pub use credential::{
    Credential, CredentialResolver, FileServiceCredential, ResolverMode, ServiceCredentialSource,
    UserIdentity,
};
pub use error::{Error, Result};
pub use protocol::{ClientRequest, ServerMessage};
pub use resource::{EventPhase, ResourceEvent, ResourceKind, WatchKey, WatchTarget};
pub use server::{router, serve, start_server, AppState, ServerConfig};
pub use subscription::{RegistryConfig, SubscribeParams, SubscriptionRegistry};
pub use watcher::{BackoffConfig, ResourceWatcher, WatcherMessage, WatcherState};
