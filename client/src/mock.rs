//! Test doubles: an in-process claw server, a canned token reader and an
//! emitter that records requests.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use crate::channel::Emitter;
use crate::notify::{Notification, Notifier};
use crate::permit::{PermitMetadata, TokenReader};
use crate::{Error, Result};
use clawbet_types::{Frame, Notice, Request, ServerEvent};
use ethers::types::Address;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};

#[derive(Clone, Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Scripted answer to one request name.
struct Reply {
    data: Value,
    /// Events written right after the ack, on the same socket.
    then: Vec<String>,
}

struct Shared {
    received: mpsc::UnboundedSender<Frame>,
    outbound: broadcast::Sender<Outbound>,
    replies: Mutex<HashMap<String, Reply>>,
    connections: AtomicUsize,
}

pub(crate) struct MockServer {
    pub url: String,
    shared: Arc<Shared>,
    received: mpsc::UnboundedReceiver<Frame>,
    server_handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            received: received_tx,
            outbound,
            replies: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
        });

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let router = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(shared.clone());
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let actual_addr = listener.local_addr().unwrap();
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Self {
            url: format!("ws://{actual_addr}/ws"),
            shared,
            received,
            server_handle,
        }
    }

    /// Answer every future request named `event` with `data`.
    pub fn reply(&self, event: &str, data: Value) {
        self.reply_then(event, data, []);
    }

    /// Like [`MockServer::reply`], then push `events` back to back.
    pub fn reply_then(
        &self,
        event: &str,
        data: Value,
        events: impl IntoIterator<Item = ServerEvent>,
    ) {
        let then = events
            .into_iter()
            .map(|e| e.to_frame().unwrap().encode().unwrap())
            .collect();
        self.shared
            .replies
            .lock()
            .unwrap()
            .insert(event.to_string(), Reply { data, then });
    }

    /// Push an event to every connected client.
    pub fn push(&self, event: ServerEvent) {
        let text = event.to_frame().unwrap().encode().unwrap();
        let _ = self.shared.outbound.send(Outbound::Text(text));
    }

    /// Close every open socket from the server side.
    pub fn drop_connections(&self) {
        let _ = self.shared.outbound.send(Outbound::Close);
    }

    pub async fn wait_connections(&self, expected: usize) {
        timeout(Duration::from_secs(5), async {
            while self.shared.connections.load(Ordering::SeqCst) != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for connections");
    }

    /// Next frame received from any client.
    pub async fn recv(&mut self) -> Frame {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("server stopped")
    }

    /// Skip frames until one named `event` arrives.
    pub async fn recv_event(&mut self, event: &str) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.event.as_deref() == Some(event) {
                return frame;
            }
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

async fn ws_handler(
    State(shared): State<Arc<Shared>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn serve_socket(socket: WebSocket, shared: Arc<Shared>) {
    let mut outbound = shared.outbound.subscribe();
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Ok(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Outbound::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Err(_) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                        continue;
                    };
                    if let (Some(event), Some(id)) = (frame.event.as_deref(), frame.ack) {
                        let texts = shared.replies.lock().unwrap().get(event).map(|reply| {
                            let ack = Frame::reply(id, reply.data.clone()).encode().unwrap();
                            std::iter::once(ack).chain(reply.then.clone()).collect::<Vec<_>>()
                        });
                        let mut sent = true;
                        for text in texts.unwrap_or_default() {
                            if sink.send(Message::Text(text)).await.is_err() {
                                sent = false;
                                break;
                            }
                        }
                        if !sent {
                            break;
                        }
                    }
                    let _ = shared.received.send(frame);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    shared.connections.fetch_sub(1, Ordering::SeqCst);
}

/// Token reader returning fixed metadata, or failing every read.
#[derive(Clone)]
pub(crate) struct StaticReader {
    metadata: Option<PermitMetadata>,
}

impl StaticReader {
    pub fn new(metadata: PermitMetadata) -> Self {
        Self {
            metadata: Some(metadata),
        }
    }

    pub fn failing() -> Self {
        Self { metadata: None }
    }
}

impl TokenReader for StaticReader {
    async fn permit_metadata(&self, _owner: Address) -> Result<PermitMetadata> {
        self.metadata
            .clone()
            .ok_or_else(|| Error::Contract("execution reverted".to_string()))
    }
}

/// Emitter that records every frame and answers all requests with `reply`.
pub(crate) struct RecordingEmitter {
    reply: Value,
    sent: Mutex<Vec<(&'static str, Value)>>,
}

impl RecordingEmitter {
    pub fn new(reply: Value) -> Self {
        Self {
            reply,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(&'static str, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Emitter for RecordingEmitter {
    fn emit<N: Notice>(&self, notice: N) -> Result<()> {
        let data = serde_json::to_value(&notice)?;
        self.sent.lock().unwrap().push((N::EVENT, data));
        Ok(())
    }

    async fn request<R: Request>(&self, request: R) -> Result<R::Ack> {
        let data = serde_json::to_value(&request)?;
        self.sent.lock().unwrap().push((R::EVENT, data));
        Ok(serde_json::from_value(self.reply.clone())?)
    }
}

/// Notifier that keeps every intent for inspection.
#[derive(Clone, Default)]
pub(crate) struct RecordingNotifier {
    log: Arc<Mutex<Vec<Notification>>>,
    celebrations: Arc<AtomicUsize>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.log.lock().unwrap().clone()
    }

    pub fn celebrations(&self) -> usize {
        self.celebrations.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` notifications were issued.
    pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
        timeout(Duration::from_secs(5), async {
            loop {
                let log = self.notifications();
                if log.len() >= count {
                    return log;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for notifications")
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, notification: Notification) {
        self.log.lock().unwrap().push(notification);
    }

    fn celebrate(&mut self) {
        self.celebrations.fetch_add(1, Ordering::SeqCst);
    }
}
