//! Websocket gateway
//!
//! One connection per browser tab. Each connection owns a
//! [`SubscriptionRegistry`]; control frames mutate it and watcher messages
//! are fanned out to the channels bound to them.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{decode_client_frame, ClientRequest, ServerMessage};
use crate::server::AppState;
use crate::subscription::SubscriptionRegistry;
use crate::watcher::WatcherMessage;

/// How often to send websocket pings
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a pong before dropping the connection
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Upgrade `GET /dashboard/api/websocket`
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();
    let (registry, events) = SubscriptionRegistry::new(
        state.resolver.clone(),
        state.factory.clone(),
        state.registry.clone(),
    );
    info!("Dashboard websocket connected");
    run_connection(sender, receiver, registry, events).await;
    info!("Dashboard websocket closed");
}

/// Ping bookkeeping for one connection
struct Keepalive {
    last_pong: Instant,
    awaiting_pong: bool,
}

impl Keepalive {
    fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            awaiting_pong: false,
        }
    }

    /// Called on every ping tick; `false` once the peer missed its deadline
    fn tick(&mut self) -> bool {
        if self.awaiting_pong && self.last_pong.elapsed() > PONG_TIMEOUT {
            return false;
        }
        self.awaiting_pong = true;
        true
    }

    fn pong(&mut self) {
        self.last_pong = Instant::now();
        self.awaiting_pong = false;
    }
}

/// Drive one connection until the peer leaves or stops answering pings.
/// Every watcher the connection started is stopped on the way out.
pub(crate) async fn run_connection<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut registry: SubscriptionRegistry,
    mut events: mpsc::Receiver<WatcherMessage>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // first tick completes immediately
    ping_interval.tick().await;
    let mut keepalive = Keepalive::new();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if !keepalive.tick() {
                    warn!("No pong received, dropping connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            message = events.recv() => {
                let Some(message) = message else { break };
                if !send_all(&mut sender, registry.publish(&message)).await {
                    break;
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let replies = handle_text(&mut registry, text.as_str()).await;
                        if !send_all(&mut sender, replies).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame");
                    }
                    // axum answers pings itself
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Pong(_))) => keepalive.pong(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "Websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    registry.dispose();
    let _ = sender.send(Message::Close(None)).await;
}

/// Apply one inbound text frame and return the replies it produces
pub(crate) async fn handle_text(
    registry: &mut SubscriptionRegistry,
    text: &str,
) -> Vec<ServerMessage> {
    let request = match decode_client_frame(text) {
        Ok(request) => request,
        Err(reason) => {
            debug!(%reason, "Ignoring client frame");
            return Vec::new();
        }
    };

    match request {
        ClientRequest::Subscribe { channel, params } => {
            match registry.subscribe(&channel, params).await {
                Ok(()) => Vec::new(),
                Err(e) => {
                    debug!(channel = %channel, error = %e, "Subscribe rejected");
                    vec![ServerMessage::error(channel, e.client_message())]
                }
            }
        }
        ClientRequest::Unsubscribe { channel } => {
            registry.unsubscribe(&channel);
            Vec::new()
        }
        ClientRequest::Invalid { channel, reason } => {
            debug!(channel = %channel, %reason, "Invalid subscribe params");
            vec![ServerMessage::error(channel, reason)]
        }
    }
}

/// Send every message in order; `false` once the socket is gone
async fn send_all<S>(sender: &mut S, messages: Vec<ServerMessage>) -> bool
where
    S: Sink<Message> + Unpin,
{
    for message in messages {
        if sender
            .send(Message::Text(message.to_text().into()))
            .await
            .is_err()
        {
            return false;
        }
    }
    true
}
