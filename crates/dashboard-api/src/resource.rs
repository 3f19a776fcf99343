//! Watched resource types and the events produced for them
//!
//! A [`WatchTarget`] (kind + namespace) is what a websocket channel binds to.
//! A [`WatchKey`] adds the continuation cursor and identifies one upstream
//! watch request. Every parsed upstream frame becomes one immutable
//! [`ResourceEvent`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Group/version/plural triple of a watchable resource collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    /// API group (empty for the core group)
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name used in URLs
    pub plural: String,
}

impl ResourceKind {
    /// Create a kind from its group, version and plural name
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            plural: plural.into(),
        }
    }

    /// `workspace.devfile.io/v1alpha2` DevWorkspaces
    pub fn dev_workspace() -> Self {
        Self::new("workspace.devfile.io", "v1alpha2", "devworkspaces")
    }

    /// Core `v1` pods
    pub fn pod() -> Self {
        Self::new("", "v1", "pods")
    }

    /// Core `v1` events
    pub fn event() -> Self {
        Self::new("", "v1", "events")
    }

    /// Kind implied by one of the dashboard's well-known channel names
    pub fn for_channel(channel: &str) -> Option<Self> {
        match channel {
            "devWorkspace" | "devworkspace" | "devworkspaces" => Some(Self::dev_workspace()),
            "pod" | "pods" => Some(Self::pod()),
            "event" | "events" => Some(Self::event()),
            _ => None,
        }
    }

    /// Parse a kind from a short name (`devworkspaces`, `pods`, `events`)
    /// or a `group/version/plural` / `version/plural` path.
    pub fn parse(value: &str) -> Option<Self> {
        if let Some(kind) = Self::for_channel(value) {
            return Some(kind);
        }

        let parts: Vec<&str> = value.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [version, plural] => Some(Self::new("", *version, *plural)),
            [group, version, plural] => Some(Self::new(*group, *version, *plural)),
            _ => None,
        }
    }

    /// Namespaced collection path, e.g.
    /// `/apis/workspace.devfile.io/v1alpha2/namespaces/ns1/devworkspaces`
    pub fn collection_path(&self, namespace: &str) -> String {
        if self.group.is_empty() {
            format!(
                "/api/{}/namespaces/{}/{}",
                self.version, namespace, self.plural
            )
        } else {
            format!(
                "/apis/{}/{}/namespaces/{}/{}",
                self.group, self.version, namespace, self.plural
            )
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// A resource collection in one namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchTarget {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace being watched
    pub namespace: String,
}

impl WatchTarget {
    /// Create a target
    pub fn new(kind: ResourceKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
        }
    }

    /// Attach a continuation cursor
    pub fn key(&self, resource_version: Option<String>) -> WatchKey {
        WatchKey {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            resource_version,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.kind, self.namespace)
    }
}

/// Identifies one upstream watch request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace being watched
    pub namespace: String,
    /// Continuation cursor the stream was (re)opened from
    pub resource_version: Option<String>,
}

impl WatchKey {
    /// The kind/namespace pair without the cursor
    pub fn target(&self) -> WatchTarget {
        WatchTarget::new(self.kind.clone(), self.namespace.clone())
    }
}

/// Kubernetes `Status` body as sent in error responses and `ERROR` frames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    /// HTTP-equivalent status code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Machine-readable reason (`Expired`, `Forbidden`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusBody {
    /// Best available description of the status
    pub fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.reason.clone())
            .unwrap_or_else(|| match self.code {
                Some(code) => format!("watch error (code {})", code),
                None => "watch error".to_string(),
            })
    }
}

/// Change phase of a [`ResourceEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventPhase {
    /// Object was created (or listed at the start of a watch)
    Added,
    /// Object was updated
    Modified,
    /// Object was removed
    Deleted,
    /// Upstream reported an error status on the stream
    Error,
}

/// What an event carries
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// The full resource object
    Object(serde_json::Value),
    /// Upstream status for [`EventPhase::Error`]
    Status(StatusBody),
}

/// One parsed upstream frame
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    /// Change phase
    pub phase: EventPhase,
    /// Object or status
    pub payload: EventPayload,
    /// Watch the event was read from
    pub source: WatchKey,
}

impl ResourceEvent {
    /// `metadata.resourceVersion` of the carried object
    pub fn resource_version(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Object(obj) => object_resource_version(obj),
            EventPayload::Status(_) => None,
        }
    }

    /// Payload sent to websocket subscribers
    pub fn to_message(&self) -> serde_json::Value {
        match &self.payload {
            EventPayload::Object(obj) => serde_json::json!({
                "eventPhase": self.phase,
                "object": obj,
            }),
            EventPayload::Status(status) => serde_json::json!({
                "eventPhase": EventPhase::Error,
                "status": status,
            }),
        }
    }
}

/// Read `metadata.resourceVersion` from a raw object
pub fn object_resource_version(obj: &serde_json::Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_path_custom_resource() {
        assert_eq!(
            ResourceKind::dev_workspace().collection_path("ns1"),
            "/apis/workspace.devfile.io/v1alpha2/namespaces/ns1/devworkspaces"
        );
    }

    #[test]
    fn test_collection_path_core_resource() {
        assert_eq!(
            ResourceKind::pod().collection_path("user-che"),
            "/api/v1/namespaces/user-che/pods"
        );
    }

    #[test]
    fn test_for_channel_well_known_names() {
        assert_eq!(
            ResourceKind::for_channel("devWorkspace"),
            Some(ResourceKind::dev_workspace())
        );
        assert_eq!(ResourceKind::for_channel("pod"), Some(ResourceKind::pod()));
        assert_eq!(ResourceKind::for_channel("event"), Some(ResourceKind::event()));
        assert_eq!(ResourceKind::for_channel("c1"), None);
    }

    #[test]
    fn test_parse_paths() {
        assert_eq!(
            ResourceKind::parse("apps/v1/deployments"),
            Some(ResourceKind::new("apps", "v1", "deployments"))
        );
        assert_eq!(
            ResourceKind::parse("v1/configmaps"),
            Some(ResourceKind::new("", "v1", "configmaps"))
        );
        assert_eq!(ResourceKind::parse("pods"), Some(ResourceKind::pod()));
        assert_eq!(ResourceKind::parse("deployments"), None);
        assert_eq!(ResourceKind::parse("a//b"), None);
        assert_eq!(ResourceKind::parse("a/b/c/d"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ResourceKind::dev_workspace().to_string(),
            "workspace.devfile.io/v1alpha2/devworkspaces"
        );
        assert_eq!(
            WatchTarget::new(ResourceKind::pod(), "ns1").to_string(),
            "v1/pods in ns1"
        );
    }

    #[test]
    fn test_event_message_for_object() {
        let event = ResourceEvent {
            phase: EventPhase::Added,
            payload: EventPayload::Object(serde_json::json!({
                "metadata": {"name": "w1", "resourceVersion": "42"}
            })),
            source: WatchTarget::new(ResourceKind::dev_workspace(), "ns1").key(None),
        };
        assert_eq!(event.resource_version(), Some("42"));

        let msg = event.to_message();
        assert_eq!(msg["eventPhase"], "ADDED");
        assert_eq!(msg["object"]["metadata"]["name"], "w1");
    }

    #[test]
    fn test_event_message_for_status() {
        let event = ResourceEvent {
            phase: EventPhase::Error,
            payload: EventPayload::Status(StatusBody {
                code: Some(500),
                message: Some("etcd unavailable".into()),
                reason: None,
            }),
            source: WatchTarget::new(ResourceKind::dev_workspace(), "ns1").key(None),
        };
        assert_eq!(event.resource_version(), None);

        let msg = event.to_message();
        assert_eq!(msg["eventPhase"], "ERROR");
        assert_eq!(msg["status"]["message"], "etcd unavailable");
        assert!(msg["status"].get("reason").is_none());
    }

    #[test]
    fn test_status_describe_fallbacks() {
        let status = StatusBody {
            code: Some(410),
            message: None,
            reason: Some("Expired".into()),
        };
        assert_eq!(status.describe(), "Expired");
        assert_eq!(
            StatusBody { code: Some(500), ..Default::default() }.describe(),
            "watch error (code 500)"
        );
    }

    #[test]
    fn test_object_resource_version_missing() {
        assert_eq!(object_resource_version(&serde_json::json!({})), None);
        assert_eq!(
            object_resource_version(&serde_json::json!({"metadata": {"resourceVersion": ""}})),
            None
        );
    }
}
