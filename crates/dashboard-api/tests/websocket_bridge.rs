//! End-to-end tests: a real websocket client talking to the dashboard server,
//! which watches a fake cluster API over HTTP.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use dashboard_api::{
    serve, AppState, ClusterConfig, CredentialResolver, RegistryConfig, ReqwestClientFactory,
};

const GOOD_TOKEN: &str = "good-token";
const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Fake cluster API
// ============================================================================

/// One open watch as seen by the fake API server
struct OpenWatch {
    namespace: String,
    query: String,
    frames: mpsc::UnboundedSender<Result<Bytes, Infallible>>,
}

#[derive(Clone)]
struct FakeApi {
    watches: Arc<Mutex<Vec<OpenWatch>>>,
    opened: Arc<watch::Sender<usize>>,
}

impl FakeApi {
    fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            watches: Arc::new(Mutex::new(Vec::new())),
            opened: Arc::new(opened),
        }
    }

    async fn wait_for_watches(&self, n: usize) {
        let mut rx = self.opened.subscribe();
        timeout(WAIT, rx.wait_for(|count| *count >= n))
            .await
            .expect("timed out waiting for upstream watch")
            .unwrap();
    }

    fn send(&self, index: usize, frame: Value) {
        let mut line = serde_json::to_vec(&frame).unwrap();
        line.push(b'\n');
        let watches = self.watches.lock().unwrap();
        watches[index]
            .frames
            .unbounded_send(Ok(Bytes::from(line)))
            .unwrap();
    }

    fn query(&self, index: usize) -> String {
        self.watches.lock().unwrap()[index].query.clone()
    }

    fn namespace(&self, index: usize) -> String {
        self.watches.lock().unwrap()[index].namespace.clone()
    }

    /// Wait until the dashboard drops the watch. Blank keepalive lines make
    /// the server notice the peer went away.
    async fn wait_closed(&self, index: usize) {
        timeout(WAIT, async {
            loop {
                {
                    let watches = self.watches.lock().unwrap();
                    let frames = &watches[index].frames;
                    if frames.is_closed()
                        || frames.unbounded_send(Ok(Bytes::from_static(b"\n"))).is_err()
                    {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("upstream watch was not closed");
    }
}

async fn watch_devworkspaces(
    State(api): State<FakeApi>,
    Path(namespace): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {GOOD_TOKEN}"));
    if !authorized {
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "Unauthorized",
            "reason": "Unauthorized",
            "code": 401
        });
        return (StatusCode::UNAUTHORIZED, axum::Json(status)).into_response();
    }

    let (frames, rx) = mpsc::unbounded();
    api.watches.lock().unwrap().push(OpenWatch {
        namespace,
        query: query.unwrap_or_default(),
        frames,
    });
    api.opened.send_modify(|count| *count += 1);
    Body::from_stream(rx).into_response()
}

async fn spawn_fake_api(api: FakeApi) -> SocketAddr {
    let app = Router::new()
        .route(
            "/apis/workspace.devfile.io/v1alpha2/namespaces/{namespace}/devworkspaces",
            get(watch_devworkspaces),
        )
        .with_state(api);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ============================================================================
// Dashboard server + client
// ============================================================================

async fn spawn_dashboard(api_addr: SocketAddr) -> SocketAddr {
    let factory = ReqwestClientFactory::new(ClusterConfig {
        api_url: format!("http://{api_addr}"),
        ca_cert_path: None,
        ..ClusterConfig::default()
    })
    .await
    .unwrap();
    let state = AppState {
        resolver: Arc::new(CredentialResolver::passthrough()),
        factory: Arc::new(factory),
        registry: RegistryConfig::default(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, state, std::future::pending()).await.unwrap();
    });
    addr
}

async fn setup() -> (FakeApi, SocketAddr) {
    let api = FakeApi::new();
    let api_addr = spawn_fake_api(api.clone()).await;
    let addr = spawn_dashboard(api_addr).await;
    (api, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/dashboard/api/websocket"))
        .await
        .unwrap();
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::text(value.to_string()))
        .await
        .unwrap();
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn subscribe(channel: &str, token: &str, namespace: &str) -> Value {
    json!({
        "request": "SUBSCRIBE",
        "channel": channel,
        "params": {"token": token, "namespace": namespace}
    })
}

fn workspace(kind: &str, name: &str, rv: &str) -> Value {
    json!({
        "type": kind,
        "object": {
            "kind": "DevWorkspace",
            "metadata": {"name": name, "namespace": "ns1", "resourceVersion": rv}
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_healthz() {
    let (_api, addr) = setup().await;
    let body = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_subscribe_streams_events_until_unsubscribed() {
    let (api, addr) = setup().await;
    let mut client = connect(addr).await;

    send_json(&mut client, subscribe("c1", GOOD_TOKEN, "ns1")).await;
    api.wait_for_watches(1).await;
    assert_eq!(api.namespace(0), "ns1");
    assert!(api.query(0).contains("watch=true"));

    api.send(0, workspace("ADDED", "w1", "5"));
    let message = next_json(&mut client).await;
    assert_eq!(message["channel"], "c1");
    assert_eq!(message["message"]["eventPhase"], "ADDED");
    assert_eq!(message["message"]["object"]["metadata"]["name"], "w1");

    api.send(0, workspace("MODIFIED", "w1", "6"));
    let message = next_json(&mut client).await;
    assert_eq!(message["message"]["eventPhase"], "MODIFIED");

    send_json(
        &mut client,
        json!({"request": "UNSUBSCRIBE", "channel": "c1"}),
    )
    .await;
    api.wait_closed(0).await;
}

#[tokio::test]
async fn test_two_channels_share_one_watch() {
    let (api, addr) = setup().await;
    let mut client = connect(addr).await;

    send_json(&mut client, subscribe("a", GOOD_TOKEN, "ns1")).await;
    send_json(&mut client, subscribe("b", GOOD_TOKEN, "ns1")).await;
    api.wait_for_watches(1).await;

    api.send(0, workspace("ADDED", "w1", "1"));
    let mut channels = vec![
        next_json(&mut client).await["channel"].as_str().unwrap().to_string(),
        next_json(&mut client).await["channel"].as_str().unwrap().to_string(),
    ];
    channels.sort();
    assert_eq!(channels, vec!["a", "b"]);
    assert_eq!(api.watches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_token_rejected_on_channel() {
    let (api, addr) = setup().await;
    let mut client = connect(addr).await;

    send_json(&mut client, subscribe("c1", "", "ns1")).await;
    let message = next_json(&mut client).await;
    assert_eq!(
        message,
        json!({"channel": "c1", "message": {"error": "Unauthorized"}})
    );
    assert_eq!(api.watches.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn test_rejected_token_reported_on_channel() {
    let (_api, addr) = setup().await;
    let mut client = connect(addr).await;

    send_json(&mut client, subscribe("c1", "someone-else", "ns1")).await;
    let message = next_json(&mut client).await;
    assert_eq!(
        message,
        json!({"channel": "c1", "message": {"error": "Unauthorized"}})
    );
}

#[tokio::test]
async fn test_malformed_frames_ignored() {
    let (api, addr) = setup().await;
    let mut client = connect(addr).await;

    client.send(Message::text("not json")).await.unwrap();
    send_json(&mut client, json!({"channel": "c1"})).await;
    send_json(&mut client, json!({"request": "SUBSCRIBE"})).await;
    client
        .send(Message::binary(vec![1u8, 2, 3]))
        .await
        .unwrap();

    send_json(&mut client, subscribe("c1", GOOD_TOKEN, "ns1")).await;
    api.wait_for_watches(1).await;
    api.send(0, workspace("ADDED", "w1", "1"));
    assert_eq!(next_json(&mut client).await["channel"], "c1");
}

#[tokio::test]
async fn test_disconnect_stops_upstream_watches() {
    let (api, addr) = setup().await;
    let mut client = connect(addr).await;

    send_json(&mut client, subscribe("c1", GOOD_TOKEN, "ns1")).await;
    send_json(&mut client, subscribe("c2", GOOD_TOKEN, "ns2")).await;
    api.wait_for_watches(2).await;

    client.close(None).await.unwrap();
    api.wait_closed(0).await;
    api.wait_closed(1).await;
}
