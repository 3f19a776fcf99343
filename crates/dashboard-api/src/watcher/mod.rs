//! Single-namespace resource watcher
//!
//! A [`ResourceWatcher`] owns one upstream watch stream for one
//! (kind, namespace) pair. The stream runs in its own task; everything it
//! produces is pushed, in upstream order, onto the owner's
//! [`WatcherMessage`] queue.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──► Connecting ──frame──► Streaming
//!                     ▲                     │ stream ended / transient error
//!                     └──── Reconnecting ◄──┘
//!
//! any non-terminal ──stop──► Stopped
//! auth / not found / too many failures ──► Failed
//! ```
//!
//! Reconnects resume from the `resourceVersion` of the last parsed frame, so
//! delivery is at-least-once across drops. `Stopped` and `Failed` are
//! terminal: a watcher is never restarted once it reaches either.

mod backoff;
mod frame;

pub use backoff::{Backoff, BackoffConfig};
pub use frame::{parse_frame, FrameDecoder, WatchFrame};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster_client::{ClusterClientFactory, WatchQuery};
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::resource::{object_resource_version, EventPayload, EventPhase, ResourceEvent, WatchKey};

/// Identifies a watcher within its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

impl WatcherId {
    /// Wrap a raw id
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Observable watcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Created, not started
    Idle,
    /// Opening the upstream stream
    Connecting,
    /// At least one frame received on the current stream
    Streaming,
    /// Waiting out the backoff before reopening
    Reconnecting,
    /// Stopped by the owner
    Stopped,
    /// Gave up after a non-recoverable error
    Failed,
}

impl WatcherState {
    /// Whether the watcher can never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, WatcherState::Stopped | WatcherState::Failed)
    }
}

/// Output of a watcher, consumed by its owner
#[derive(Debug, Clone)]
pub enum WatcherMessage {
    /// A parsed upstream event
    Event {
        /// Producing watcher
        watcher: WatcherId,
        /// The event, shared by every subscriber
        event: Arc<ResourceEvent>,
    },
    /// The watcher entered `Failed` and will not reconnect
    Failed {
        /// Producing watcher
        watcher: WatcherId,
        /// Client-facing error text
        message: String,
    },
}

impl WatcherMessage {
    /// Watcher that produced this message
    pub fn watcher(&self) -> WatcherId {
        match self {
            WatcherMessage::Event { watcher, .. } | WatcherMessage::Failed { watcher, .. } => {
                *watcher
            }
        }
    }
}

/// Handle to one upstream watch
pub struct ResourceWatcher {
    id: WatcherId,
    factory: Arc<dyn ClusterClientFactory>,
    backoff: BackoffConfig,
    events: mpsc::Sender<WatcherMessage>,
    state: Arc<watch::Sender<WatcherState>>,
    credential_tx: Option<watch::Sender<Credential>>,
    credential: Option<Credential>,
    cancel: CancellationToken,
}

impl ResourceWatcher {
    /// Create an idle watcher that reports on `events`
    pub fn new(
        id: WatcherId,
        factory: Arc<dyn ClusterClientFactory>,
        backoff: BackoffConfig,
        events: mpsc::Sender<WatcherMessage>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            id,
            factory,
            backoff,
            events,
            state: Arc::new(state),
            credential_tx: None,
            credential: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Id assigned at creation
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Credential the stream is (or will next be) opened with
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Open the watch for `key`, resuming from its cursor if present.
    ///
    /// Only an idle watcher can be started; later calls are ignored.
    pub fn start(&mut self, key: WatchKey, credential: Credential) {
        if self.state() != WatcherState::Idle {
            warn!(watcher = %self.id, state = ?self.state(), "Ignoring start on a used watcher");
            return;
        }
        self.state.send_replace(WatcherState::Connecting);

        let (credential_tx, credential_rx) = watch::channel(credential.clone());
        self.credential_tx = Some(credential_tx);
        self.credential = Some(credential.clone());

        info!(
            watcher = %self.id,
            target = %key.target(),
            resource_version = ?key.resource_version,
            "Starting watch"
        );

        let task = WatchTask {
            id: self.id,
            path: key.kind.collection_path(&key.namespace),
            key,
            credential,
            credential_rx,
            factory: self.factory.clone(),
            backoff: Backoff::new(self.backoff.clone()),
            events: self.events.clone(),
            state: self.state.clone(),
        };
        tokio::spawn(task.run(self.cancel.clone()));
    }

    /// Reopen the stream with `credential`, keeping the cursor.
    ///
    /// No-op on idle or terminal watchers.
    pub fn refresh(&mut self, credential: Credential) {
        let state = self.state();
        if state == WatcherState::Idle || state.is_terminal() {
            debug!(watcher = %self.id, state = ?state, "Ignoring refresh");
            return;
        }
        if let Some(tx) = &self.credential_tx {
            debug!(watcher = %self.id, "Refreshing watch credential");
            self.credential = Some(credential.clone());
            tx.send_replace(credential);
        }
    }

    /// Stop the watch and abort the in-flight request. Idempotent.
    pub fn stop(&mut self) {
        let stopped = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = WatcherState::Stopped;
                true
            }
        });
        self.cancel.cancel();
        if stopped {
            info!(watcher = %self.id, "Watch stopped");
        }
    }
}

impl Drop for ResourceWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Watch task
// ============================================================================

/// Why one stream attempt ended
enum StreamEnd {
    /// Credential changed; reopen immediately
    Refreshed,
    /// Upstream closed the response after the given uptime
    Closed(Duration),
    /// Cursor too old; reopen without it
    Expired,
    /// Transient failure; reopen after backoff
    Interrupted(Error),
    /// Do not reconnect
    Fatal(Error),
    /// Owner is gone
    Abandoned,
}

struct WatchTask {
    id: WatcherId,
    path: String,
    /// Current key; `resource_version` is the continuation cursor
    key: WatchKey,
    credential: Credential,
    credential_rx: watch::Receiver<Credential>,
    factory: Arc<dyn ClusterClientFactory>,
    backoff: Backoff,
    events: mpsc::Sender<WatcherMessage>,
    state: Arc<watch::Sender<WatcherState>>,
}

impl WatchTask {
    async fn run(mut self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(watcher = %self.id, "Watch task cancelled");
            }
            _ = self.watch_loop() => {}
        }
    }

    async fn watch_loop(&mut self) {
        loop {
            self.set_state(WatcherState::Connecting);

            let reason = match self.stream_once().await {
                StreamEnd::Refreshed => {
                    self.backoff.reset();
                    continue;
                }
                StreamEnd::Abandoned => return,
                StreamEnd::Fatal(e) => {
                    self.fail(&e, e.client_message()).await;
                    return;
                }
                StreamEnd::Expired => {
                    info!(
                        watcher = %self.id,
                        resource_version = ?self.key.resource_version,
                        "Watch cursor expired, restarting without it"
                    );
                    self.key.resource_version = None;
                    if self.backoff.next_delay().is_none() {
                        let e = Error::Resource {
                            status: 410,
                            message: "resource version expired".into(),
                        };
                        let message = self.give_up_message(&e);
                        self.fail(&e, message).await;
                        return;
                    }
                    continue;
                }
                StreamEnd::Closed(uptime) => {
                    // routine server-side timeouts on a quiet stream
                    self.backoff.record_uptime(uptime);
                    Error::UpstreamUnavailable("watch closed by server".into())
                }
                StreamEnd::Interrupted(e) => e,
            };

            self.set_state(WatcherState::Reconnecting);
            let Some(delay) = self.backoff.next_delay() else {
                let message = self.give_up_message(&reason);
                self.fail(&reason, message).await;
                return;
            };

            warn!(
                watcher = %self.id,
                target = %self.key.target(),
                error = %reason,
                attempt = self.backoff.failures(),
                delay_ms = delay.as_millis(),
                "Watch interrupted, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.credential_rx.changed() => {
                    if self.take_refresh(changed).is_none() {
                        return;
                    }
                    self.backoff.reset();
                }
            }
        }
    }

    /// Open one stream and pump it until it ends
    async fn stream_once(&mut self) -> StreamEnd {
        let client = match self.factory.build(&self.credential) {
            Ok(client) => client,
            Err(e) => return StreamEnd::Fatal(e),
        };
        let source = self.key.clone();
        let query = WatchQuery::from_cursor(source.resource_version.clone());

        let opened = tokio::select! {
            opened = client.open_watch(&self.path, &query) => opened,
            changed = self.credential_rx.changed() => {
                return self.take_refresh(changed).unwrap_or(StreamEnd::Abandoned);
            }
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return classify_open_error(e),
        };
        debug!(watcher = %self.id, path = %self.path, "Watch stream open");
        let opened_at = Instant::now();

        let mut decoder = FrameDecoder::new();
        loop {
            tokio::select! {
                changed = self.credential_rx.changed() => {
                    return self.take_refresh(changed).unwrap_or(StreamEnd::Abandoned);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = decoder.push(&bytes) {
                            warn!(watcher = %self.id, error = %e, "Discarding oversized watch frame");
                        }
                        while let Some(frame) = decoder.next_frame() {
                            if let Some(end) = self.handle_frame(frame, &source).await {
                                return end;
                            }
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Interrupted(e),
                    None => {
                        if let Some(frame) = decoder.finish() {
                            if let Some(end) = self.handle_frame(frame, &source).await {
                                return end;
                            }
                        }
                        return StreamEnd::Closed(opened_at.elapsed());
                    }
                }
            }
        }
    }

    /// Apply one frame; `Some` ends the current stream
    async fn handle_frame(
        &mut self,
        frame: Result<WatchFrame>,
        source: &WatchKey,
    ) -> Option<StreamEnd> {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(watcher = %self.id, error = %e, "Dropping unparseable watch frame");
                return None;
            }
        };

        match frame {
            WatchFrame::Event { phase, object } => {
                self.mark_streaming();
                if let Some(rv) = object_resource_version(&object) {
                    self.key.resource_version = Some(rv.to_string());
                }
                let event = ResourceEvent {
                    phase,
                    payload: EventPayload::Object(object),
                    source: source.clone(),
                };
                self.emit(WatcherMessage::Event {
                    watcher: self.id,
                    event: Arc::new(event),
                })
                .await
            }
            WatchFrame::Bookmark { resource_version } => {
                self.mark_streaming();
                if resource_version.is_some() {
                    self.key.resource_version = resource_version;
                }
                None
            }
            WatchFrame::Error(status) if status.code == Some(410) => Some(StreamEnd::Expired),
            WatchFrame::Error(status) => {
                let error = Error::Resource {
                    status: status.code.unwrap_or(500),
                    message: status.describe(),
                };
                let event = ResourceEvent {
                    phase: EventPhase::Error,
                    payload: EventPayload::Status(status),
                    source: source.clone(),
                };
                if let Some(end) = self
                    .emit(WatcherMessage::Event {
                        watcher: self.id,
                        event: Arc::new(event),
                    })
                    .await
                {
                    return Some(end);
                }
                Some(StreamEnd::Interrupted(error))
            }
        }
    }

    fn take_refresh(
        &mut self,
        changed: std::result::Result<(), watch::error::RecvError>,
    ) -> Option<StreamEnd> {
        changed.ok()?;
        self.credential = self.credential_rx.borrow_and_update().clone();
        info!(
            watcher = %self.id,
            resource_version = ?self.key.resource_version,
            "Credential refreshed, reopening watch"
        );
        Some(StreamEnd::Refreshed)
    }

    fn mark_streaming(&mut self) {
        self.backoff.reset();
        self.set_state(WatcherState::Streaming);
    }

    fn set_state(&self, next: WatcherState) {
        self.state.send_if_modified(|s| {
            if s.is_terminal() || *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
    }

    fn give_up_message(&self, last: &Error) -> String {
        format!(
            "giving up after {} consecutive failures: {}",
            self.backoff.failures(),
            last.client_message()
        )
    }

    async fn fail(&mut self, cause: &Error, message: String) {
        error!(
            watcher = %self.id,
            target = %self.key.target(),
            error = %cause,
            "Watch failed"
        );
        self.set_state(WatcherState::Failed);
        let _ = self
            .events
            .send(WatcherMessage::Failed {
                watcher: self.id,
                message,
            })
            .await;
    }

    async fn emit(&self, message: WatcherMessage) -> Option<StreamEnd> {
        match self.events.send(message).await {
            Ok(()) => None,
            Err(_) => Some(StreamEnd::Abandoned),
        }
    }
}

/// Decide how to react to a failed watch request
fn classify_open_error(e: Error) -> StreamEnd {
    match &e {
        Error::Unauthorized(_) => StreamEnd::Fatal(e),
        Error::Resource { status: 410, .. } => StreamEnd::Expired,
        Error::Resource {
            status: 401 | 403 | 404,
            ..
        } => StreamEnd::Fatal(e),
        _ if e.is_recoverable() => StreamEnd::Interrupted(e),
        _ => StreamEnd::Fatal(e),
    }
}
