//! Shared fixtures for session integration tests
//!
//! `ScriptedTransport` answers requests from a queue of scripted replies and
//! records every request it receives. Replies can be held back behind a gate
//! so tests control when a response head arrives, or fed line by line through
//! a channel to emulate a slow stream.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use routelit_client::transport::{OutboundRequest, ResponseStream};
use routelit_client::{MemoryHost, ResponseItem, Transport, TransportError};

pub enum Reply {
    Items(Vec<ResponseItem>),
    Fail(TransportError),
    Gated(oneshot::Receiver<Vec<ResponseItem>>),
    Stream(mpsc::UnboundedReceiver<Result<ResponseItem, TransportError>>),
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn reply_items(&self, items: Vec<ResponseItem>) {
        self.reply(Reply::Items(items));
    }

    /// Queue a reply released by sending on the returned gate.
    pub fn reply_gated(&self) -> oneshot::Sender<Vec<ResponseItem>> {
        let (tx, rx) = oneshot::channel();
        self.reply(Reply::Gated(rx));
        tx
    }

    /// Queue a streamed reply fed through the returned sender.
    pub fn reply_stream(&self) -> mpsc::UnboundedSender<Result<ResponseItem, TransportError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reply(Reply::Stream(rx));
        tx
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ResponseStream, TransportError> {
        self.requests.lock().unwrap().push(request);
        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            None => Ok(futures::stream::empty().boxed()),
            Some(Reply::Items(items)) => Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed()),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Gated(gate)) => {
                let items = gate
                    .await
                    .map_err(|_| TransportError::Request("gate dropped".into()))?;
                Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed())
            }
            Some(Reply::Stream(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
        }
    }
}

pub fn page() -> Url {
    Url::parse("http://localhost:8000/app").unwrap()
}

pub fn memory_host() -> Arc<MemoryHost> {
    Arc::new(MemoryHost::new(page()))
}

/// Collects every value a listener is called with.
#[derive(Clone)]
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, value: T) {
        self.seen.lock().unwrap().push(value);
    }

    pub fn values(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Wait (in 5 ms steps, up to a second) until `check` holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
