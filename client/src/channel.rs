//! Persistent event channel to the claw server.
//!
//! [`Channel`] is a cheap handle onto a background task that owns the
//! websocket. The task reconnects after every drop and reports link changes
//! and server events on the [`Stream`] returned by [`Channel::connect`].
//!
//! Requests sent with [`Channel::submit`] are settled on that same stream, so
//! their acknowledgements keep their wire order relative to server events.

use crate::events::{capacity_or_default, decode_message, ChannelEvent, Decoded, Stream};
use crate::{Config, Error, Result};
use clawbet_types::{Frame, Notice, Request};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Outbound side of the event channel.
pub trait Emitter: Send + Sync {
    /// Send a fire-and-forget message.
    fn emit<N: Notice>(&self, notice: N) -> Result<()>;

    /// Send a request and wait for its acknowledgement.
    fn request<R: Request>(&self, request: R) -> impl Future<Output = Result<R::Ack>> + Send;
}

enum Command {
    Send {
        frame: Frame,
        waiter: Option<Waiter>,
    },
    Shutdown,
}

/// Where the acknowledgement of a request goes.
enum Waiter {
    Reply(oneshot::Sender<Value>),
    Stream,
}

enum Exit {
    Dropped,
    Shutdown,
}

#[derive(Clone)]
pub struct Channel {
    commands: mpsc::UnboundedSender<Command>,
    next_ack: Arc<AtomicU64>,
    ack_timeout: Duration,
}

impl Channel {
    /// Spawn the connection task. Dropping the returned [`Stream`] stops it.
    pub fn connect(config: &Config) -> (Self, Stream) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(capacity_or_default(config.event_capacity));
        let handle = tokio::spawn(run(
            config.server_url.clone(),
            config.reconnect_delay,
            command_rx,
            event_tx,
        ));
        let channel = Self {
            commands,
            next_ack: Arc::new(AtomicU64::new(1)),
            ack_timeout: config.ack_timeout,
        };
        (channel, Stream::new(event_rx, handle))
    }

    /// Send a request whose outcome is reported on the event stream.
    ///
    /// Returns the ack id. The stream later yields either
    /// [`ChannelEvent::Ack`] with that id, in wire order with server events,
    /// or [`ChannelEvent::Unanswered`] if the frame was dropped or the link
    /// went down first. There is no timeout on this path.
    pub fn submit<R: Request>(&self, request: R) -> Result<u64> {
        let data = serde_json::to_value(&request)?;
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Send {
                frame: Frame::request(R::EVENT, data, id),
                waiter: Some(Waiter::Stream),
            })
            .map_err(|_| Error::ConnectionClosed)?;
        debug!(event = R::EVENT, ack = id, "submitted request");
        Ok(id)
    }

    /// Close the socket and stop reconnecting.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Emitter for Channel {
    fn emit<N: Notice>(&self, notice: N) -> Result<()> {
        let data = serde_json::to_value(&notice)?;
        self.commands
            .send(Command::Send {
                frame: Frame::event(N::EVENT, data),
                waiter: None,
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn request<R: Request>(&self, request: R) -> Result<R::Ack> {
        let data = serde_json::to_value(&request)?;
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                frame: Frame::request(R::EVENT, data, id),
                waiter: Some(Waiter::Reply(reply)),
            })
            .map_err(|_| Error::ConnectionClosed)?;
        debug!(event = R::EVENT, ack = id, "sent request");

        let data = match tokio::time::timeout(self.ack_timeout, response).await {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                return Err(Error::AckTimeout {
                    event: R::EVENT,
                    timeout: self.ack_timeout,
                })
            }
        };
        Ok(serde_json::from_value(data)?)
    }
}

async fn run(
    url: Url,
    reconnect_delay: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let mut pending: HashMap<u64, Waiter> = HashMap::new();
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %url, "channel connected");
                if events.send(ChannelEvent::Connected).await.is_err() {
                    return;
                }
                if let Exit::Shutdown = pump(ws, &mut commands, &events, &mut pending).await {
                    return;
                }
                info!(url = %url, "channel disconnected");

                // Reply waiters fail when dropped; stream waiters are told.
                for (id, waiter) in pending.drain() {
                    if let Waiter::Stream = waiter {
                        if events.send(ChannelEvent::Unanswered { id }).await.is_err() {
                            return;
                        }
                    }
                }
                if events.send(ChannelEvent::Disconnected).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(url = %url, error = %err, "connect failed");
            }
        }
        if !wait_reconnect(reconnect_delay, &mut commands, &events).await {
            return;
        }
    }
}

/// Shuttle frames until the socket drops. Waiters for requests still in
/// flight are left in `pending`.
async fn pump<S>(
    ws: WebSocketStream<S>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::Sender<ChannelEvent>,
    pending: &mut HashMap<u64, Waiter>,
) -> Exit
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send { frame, waiter }) => {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = ?frame.event, error = %err, "failed to encode frame");
                            if !report_unanswered(&frame, waiter, events).await {
                                return Exit::Shutdown;
                            }
                            continue;
                        }
                    };
                    if let (Some(id), Some(waiter)) = (frame.ack, waiter) {
                        pending.insert(id, waiter);
                    }
                    trace!(event = ?frame.event, ack = ?frame.ack, "sending frame");
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(error = %err, "send failed");
                        return Exit::Dropped;
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(msg)) => match decode_message(msg) {
                    Ok(Decoded::Ack { id, data }) => match pending.remove(&id) {
                        Some(Waiter::Reply(reply)) => {
                            let _ = reply.send(data);
                        }
                        Some(Waiter::Stream) => {
                            if events.send(ChannelEvent::Ack { id, data }).await.is_err() {
                                return Exit::Shutdown;
                            }
                        }
                        None => debug!(ack = id, "ack for unknown request"),
                    },
                    Ok(Decoded::Event(event)) => {
                        debug!(event = event.name(), "server event");
                        if events.send(ChannelEvent::Server(event)).await.is_err() {
                            return Exit::Shutdown;
                        }
                    }
                    Ok(Decoded::Close) => return Exit::Dropped,
                    Ok(Decoded::Skip) => {}
                    Err(err) => warn!(error = %err, "dropping malformed frame"),
                },
                Some(Err(err)) => {
                    error!("WebSocket error: {}", err);
                    return Exit::Dropped;
                }
                None => return Exit::Dropped,
            },
        }
    }
}

/// Report a frame that never reached the server to its stream waiter.
/// Returns false once nobody listens to the stream.
async fn report_unanswered(
    frame: &Frame,
    waiter: Option<Waiter>,
    events: &mpsc::Sender<ChannelEvent>,
) -> bool {
    match (frame.ack, waiter) {
        (Some(id), Some(Waiter::Stream)) => {
            events.send(ChannelEvent::Unanswered { id }).await.is_ok()
        }
        _ => true,
    }
}

/// Sleep out the reconnect delay. Frames sent meanwhile are dropped, which
/// fails their requests immediately. Returns false on shutdown.
async fn wait_reconnect(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::Sender<ChannelEvent>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(Command::Send { frame, waiter }) => {
                    debug!(event = ?frame.event, "dropping frame while disconnected");
                    if !report_unanswered(&frame, waiter, events).await {
                        return false;
                    }
                }
                Some(Command::Shutdown) | None => return false,
            },
        }
    }
}
