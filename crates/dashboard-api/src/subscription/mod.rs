//! Per-connection subscription registry
//!
//! Maps client channels onto [`ResourceWatcher`]s. Channels that ask for the
//! same (kind, namespace) share one watcher; the watcher is stopped when the
//! last such channel goes away.
//!
//! The registry is owned by exactly one websocket connection and driven from
//! that connection's task. Watchers report on a queue whose receiver is
//! handed back by [`SubscriptionRegistry::new`]; each message read from it is
//! passed to [`SubscriptionRegistry::publish`] to get the frames to send.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::cluster_client::ClusterClientFactory;
use crate::credential::CredentialResolver;
use crate::error::{Error, Result};
use crate::protocol::ServerMessage;
use crate::resource::{ResourceKind, WatchTarget};
use crate::watcher::{
    BackoffConfig, ResourceWatcher, WatcherId, WatcherMessage, WatcherState,
};

/// Default bound on channels per connection
pub const DEFAULT_MAX_CHANNELS: usize = 64;

/// Default bound on upstream watches per connection
pub const DEFAULT_MAX_WATCHERS: usize = 16;

/// Default capacity of the watcher event queue
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Longest namespace name Kubernetes accepts
const MAX_NAMESPACE_LEN: usize = 63;

/// Per-connection limits and watcher policy
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Channels one connection may hold
    pub max_channels: usize,
    /// Distinct upstream watches one connection may hold
    pub max_watchers: usize,
    /// Capacity of the watcher event queue
    pub event_buffer: usize,
    /// Reconnect policy handed to every watcher
    pub backoff: BackoffConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_channels: DEFAULT_MAX_CHANNELS,
            max_watchers: DEFAULT_MAX_WATCHERS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Parameters of a SUBSCRIBE request
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscribeParams {
    /// Caller's bearer token
    pub token: String,
    /// Namespace to watch
    pub namespace: String,
    /// Cursor to resume from
    pub resource_version: Option<String>,
    /// Resource kind (`pods`, `apps/v1/deployments`, ...)
    pub kind: Option<String>,
}

/// Channel → watcher bindings of one connection
pub struct SubscriptionRegistry {
    resolver: Arc<CredentialResolver>,
    factory: Arc<dyn ClusterClientFactory>,
    config: RegistryConfig,
    channels: BTreeMap<String, WatchTarget>,
    watchers: HashMap<WatchTarget, ResourceWatcher>,
    events: mpsc::Sender<WatcherMessage>,
    next_id: u64,
    disposed: bool,
}

impl SubscriptionRegistry {
    /// Create an empty registry and the queue its watchers report on
    pub fn new(
        resolver: Arc<CredentialResolver>,
        factory: Arc<dyn ClusterClientFactory>,
        config: RegistryConfig,
    ) -> (Self, mpsc::Receiver<WatcherMessage>) {
        let (events, rx) = mpsc::channel(config.event_buffer.max(1));
        let registry = Self {
            resolver,
            factory,
            config,
            channels: BTreeMap::new(),
            watchers: HashMap::new(),
            events,
            next_id: 0,
            disposed: false,
        };
        (registry, rx)
    }

    /// Bind `channel` to the watch described by `params`.
    ///
    /// The credential is resolved before anything changes, so a failed
    /// subscribe leaves the registry untouched.
    #[instrument(skip(self, params), fields(namespace = %params.namespace))]
    pub async fn subscribe(&mut self, channel: &str, params: SubscribeParams) -> Result<()> {
        if self.disposed {
            return Err(Error::InvalidRequest("connection is closing".into()));
        }

        let kind = resolve_kind(channel, params.kind.as_deref())?;
        validate_namespace(&params.namespace)?;
        let credential = self.resolver.resolve(&params.token).await?;
        let target = WatchTarget::new(kind, params.namespace);

        self.check_limits(channel, &target)?;

        if let Some(previous) = self.channels.insert(channel.to_string(), target.clone()) {
            if previous != target {
                debug!(channel, from = %previous, to = %target, "Rebinding channel");
                self.release(&previous);
            }
        }

        match self.watchers.get_mut(&target) {
            Some(watcher) if !watcher.state().is_terminal() => {
                if watcher.credential() != Some(&credential) {
                    watcher.refresh(credential);
                } else {
                    debug!(channel, target = %target, "Reusing watcher");
                }
            }
            _ => {
                self.next_id += 1;
                let mut watcher = ResourceWatcher::new(
                    WatcherId::new(self.next_id),
                    self.factory.clone(),
                    self.config.backoff.clone(),
                    self.events.clone(),
                );
                let resource_version = params.resource_version.filter(|rv| !rv.is_empty());
                watcher.start(target.key(resource_version), credential);
                if let Some(mut replaced) = self.watchers.insert(target.clone(), watcher) {
                    replaced.stop();
                }
            }
        }

        info!(channel, target = %target, "Channel subscribed");
        Ok(())
    }

    /// Release `channel`. Unknown channels are ignored.
    pub fn unsubscribe(&mut self, channel: &str) {
        if let Some(target) = self.channels.remove(channel) {
            info!(channel, target = %target, "Channel unsubscribed");
            self.release(&target);
        }
    }

    /// Frames produced by one watcher message.
    ///
    /// Only channels currently bound to the producing watcher receive it;
    /// messages from watchers that were already replaced or stopped are
    /// dropped.
    pub fn publish(&self, message: &WatcherMessage) -> Vec<ServerMessage> {
        let Some(target) = self
            .watchers
            .iter()
            .find(|(_, w)| w.id() == message.watcher())
            .map(|(target, _)| target)
        else {
            debug!(watcher = %message.watcher(), "Dropping message from released watcher");
            return Vec::new();
        };

        let bound = self.channels.iter().filter(|(_, t)| *t == target);
        match message {
            WatcherMessage::Event { event, .. } => bound
                .map(|(channel, _)| ServerMessage::event(channel.as_str(), event))
                .collect(),
            WatcherMessage::Failed { message, .. } => {
                warn!(target = %target, error = %message, "Watcher failed");
                bound
                    .map(|(channel, _)| ServerMessage::error(channel.as_str(), message.as_str()))
                    .collect()
            }
        }
    }

    /// Stop every watcher. Later calls are no-ops.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let count = self.watchers.len();
        for (_, mut watcher) in self.watchers.drain() {
            watcher.stop();
        }
        self.channels.clear();
        info!(watchers = count, "Subscription registry disposed");
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Number of bound channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of watchers held, including failed ones still bound
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Target `channel` is bound to
    pub fn binding(&self, channel: &str) -> Option<&WatchTarget> {
        self.channels.get(channel)
    }

    /// State of the watcher serving `target`
    pub fn watcher_state(&self, target: &WatchTarget) -> Option<WatcherState> {
        self.watchers.get(target).map(|w| w.state())
    }

    /// Reject a subscribe that would exceed the configured bounds
    fn check_limits(&self, channel: &str, target: &WatchTarget) -> Result<()> {
        let previous = self.channels.get(channel);
        if previous.is_none() && self.channels.len() >= self.config.max_channels {
            return Err(Error::LimitExceeded(format!(
                "at most {} channels per connection",
                self.config.max_channels
            )));
        }

        let reusable = self
            .watchers
            .get(target)
            .is_some_and(|w| !w.state().is_terminal());
        if reusable {
            return Ok(());
        }

        let mut live = self.watchers.len();
        if self.watchers.contains_key(target) {
            // terminal watcher is replaced in place
            live -= 1;
        }
        if let Some(previous) = previous.filter(|p| *p != target) {
            let shared = self
                .channels
                .iter()
                .any(|(c, t)| c != channel && t == previous);
            if !shared && self.watchers.contains_key(previous) {
                live -= 1;
            }
        }
        if live >= self.config.max_watchers {
            return Err(Error::LimitExceeded(format!(
                "at most {} watches per connection",
                self.config.max_watchers
            )));
        }
        Ok(())
    }

    /// Stop the watcher for `target` once no channel needs it
    fn release(&mut self, target: &WatchTarget) {
        if self.channels.values().any(|t| t == target) {
            return;
        }
        if let Some(mut watcher) = self.watchers.remove(target) {
            watcher.stop();
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Kind for a subscribe: explicit param, then channel name, then DevWorkspace
fn resolve_kind(channel: &str, kind: Option<&str>) -> Result<ResourceKind> {
    match kind.filter(|k| !k.is_empty()) {
        Some(kind) => ResourceKind::parse(kind)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown resource kind '{}'", kind))),
        None => Ok(ResourceKind::for_channel(channel).unwrap_or_else(ResourceKind::dev_workspace)),
    }
}

/// Namespaces are DNS labels
fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace.len() <= MAX_NAMESPACE_LEN
        && namespace
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !namespace.starts_with('-')
        && !namespace.ends_with('-');
    if valid {
        Ok(())
    } else if namespace.is_empty() {
        Err(Error::InvalidRequest("namespace is required".into()))
    } else {
        Err(Error::InvalidRequest(format!(
            "invalid namespace '{}'",
            namespace
        )))
    }
}
