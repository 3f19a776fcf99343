//! In-memory cluster used by watcher and registry tests
//!
//! Every `open_watch` call is recorded and backed by an unbounded channel
//! the test feeds frames into. Dropping the channel sender ends the stream;
//! the client side dropping the stream closes the sender.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::cluster_client::{
    ByteStream, ClusterClient, ClusterClientFactory, HttpResponse, Verb, WatchQuery,
};
use crate::credential::Credential;
use crate::error::{Error, Result};

/// One recorded `open_watch` call
#[derive(Debug, Clone)]
pub(crate) struct OpenRecord {
    pub path: String,
    pub query: WatchQuery,
    pub credential: Credential,
}

#[derive(Default)]
struct Inner {
    opens: Vec<OpenRecord>,
    streams: Vec<Option<mpsc::UnboundedSender<Result<Bytes>>>>,
    open_failures: VecDeque<Error>,
    held_opens: usize,
}

/// Scripted stand-in for the cluster API
#[derive(Clone)]
pub(crate) struct ScriptedCluster {
    inner: Arc<Mutex<Inner>>,
    opened: Arc<watch::Sender<usize>>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            opened: Arc::new(opened),
        }
    }

    pub fn factory(&self) -> Arc<dyn ClusterClientFactory> {
        Arc::new(self.clone())
    }

    /// Make the next `open_watch` fail with `err`
    pub fn fail_next_open(&self, err: Error) {
        self.inner.lock().unwrap().open_failures.push_back(err);
    }

    /// Make the next `open_watch` hang until the caller drops it
    pub fn hold_next_open(&self) {
        self.inner.lock().unwrap().held_opens += 1;
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.inner.lock().unwrap().opens.clone()
    }

    pub async fn wait_for_opens(&self, count: usize) {
        let mut rx = self.opened.subscribe();
        rx.wait_for(|n| *n >= count).await.unwrap();
    }

    /// Send one JSON frame on stream `index`
    pub fn send_frame(&self, index: usize, frame: serde_json::Value) {
        let mut line = serde_json::to_vec(&frame).unwrap();
        line.push(b'\n');
        self.send_raw(index, line);
    }

    /// Send raw bytes on stream `index`
    pub fn send_raw(&self, index: usize, bytes: impl Into<Bytes>) {
        let inner = self.inner.lock().unwrap();
        if let Some(Some(tx)) = inner.streams.get(index) {
            let _ = tx.send(Ok(bytes.into()));
        }
    }

    /// Fail stream `index` with a transport error
    pub fn break_stream(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.streams.get_mut(index) {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(Error::UpstreamUnavailable("connection reset".into())));
            }
        }
    }

    /// Close stream `index` cleanly
    pub fn end_stream(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.streams.get_mut(index) {
            slot.take();
        }
    }

    /// Resolve once the watcher has dropped stream `index`
    pub async fn wait_closed(&self, index: usize) {
        let tx = self.inner.lock().unwrap().streams[index].clone();
        if let Some(tx) = tx {
            tx.closed().await;
        }
    }
}

impl ClusterClientFactory for ScriptedCluster {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn ClusterClient>> {
        Ok(Arc::new(ScriptedClient {
            cluster: self.clone(),
            credential: credential.clone(),
        }))
    }
}

struct ScriptedClient {
    cluster: ScriptedCluster,
    credential: Credential,
}

#[async_trait]
impl ClusterClient for ScriptedClient {
    async fn request(
        &self,
        verb: Verb,
        path: &str,
        _body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        Err(Error::Internal(format!("unscripted request {:?} {}", verb, path)))
    }

    async fn open_watch(&self, path: &str, query: &WatchQuery) -> Result<ByteStream> {
        let (result, held) = {
            let mut inner = self.cluster.inner.lock().unwrap();
            inner.opens.push(OpenRecord {
                path: path.to_string(),
                query: query.clone(),
                credential: self.credential.clone(),
            });
            if inner.held_opens > 0 {
                inner.held_opens -= 1;
                inner.streams.push(None);
                (Err(Error::Internal("held open".into())), true)
            } else {
                (Self::next_stream(&mut inner), false)
            }
        };
        self.cluster.opened.send_modify(|n| *n += 1);
        if held {
            std::future::pending::<()>().await;
        }
        result
    }
}

impl ScriptedClient {
    fn next_stream(inner: &mut Inner) -> Result<ByteStream> {
        match inner.open_failures.pop_front() {
            Some(err) => {
                inner.streams.push(None);
                Err(err)
            }
            None => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                inner.streams.push(Some(tx));
                let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
                Ok(Box::pin(stream) as ByteStream)
            }
        }
    }
}
