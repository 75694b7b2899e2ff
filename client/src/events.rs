use crate::{Error, Result};
use clawbet_types::{api::Inbound, Frame, ServerEvent};
use futures_util::Stream as FutStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Link-level and server events produced by a [`crate::Channel`].
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// Transport (re)established. Identity must be re-sent.
    Connected,
    /// Transport dropped. In-flight requests have failed.
    Disconnected,
    Server(ServerEvent),
    /// Acknowledgement of a request sent with [`crate::Channel::submit`].
    Ack { id: u64, data: serde_json::Value },
    /// A submitted request that will never be acknowledged.
    Unanswered { id: u64 },
}

/// What the connection loop should do with one websocket message.
pub(crate) enum Decoded {
    Ack { id: u64, data: serde_json::Value },
    Event(ServerEvent),
    Close,
    Skip,
}

pub(crate) fn capacity_or_default(capacity: usize) -> usize {
    if capacity == 0 {
        DEFAULT_CHANNEL_CAPACITY
    } else {
        capacity
    }
}

pub(crate) fn decode_message(msg: Message) -> Result<Decoded> {
    match msg {
        Message::Text(text) => {
            trace!(len = text.len(), "received websocket message");
            match Frame::decode(&text)? {
                Inbound::Ack { id, data } => Ok(Decoded::Ack { id, data }),
                Inbound::Event { name, data, .. } => match ServerEvent::from_parts(&name, data) {
                    Ok(Some(event)) => Ok(Decoded::Event(event)),
                    Ok(None) => {
                        debug!(event = %name, "ignoring unknown event");
                        Ok(Decoded::Skip)
                    }
                    Err(err) => {
                        warn!(event = %name, error = %err, "failed to decode event payload");
                        Err(Error::Frame(err))
                    }
                },
            }
        }
        Message::Close(_) => {
            debug!("WebSocket closed");
            Ok(Decoded::Close)
        }
        Message::Binary(data) => {
            debug!(len = data.len(), "ignoring binary websocket message");
            Ok(Decoded::Skip)
        }
        _ => Ok(Decoded::Skip),
    }
}

/// Stream of events from the channel.
pub struct Stream {
    receiver: mpsc::Receiver<ChannelEvent>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Drop for Stream {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

impl Stream {
    pub(crate) fn new(
        receiver: mpsc::Receiver<ChannelEvent>,
        handle: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            _handle: handle,
        }
    }

    /// Receive the next event from the stream
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.receiver.recv().await
    }
}

impl FutStream for Stream {
    type Item = ChannelEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawbet_types::api::PersonalSync;

    #[test]
    fn test_decode_event_message() {
        let msg = Message::Text(r#"{"event":"personal_sync","data":{"position":3}}"#.to_string());
        let Decoded::Event(event) = decode_message(msg).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event, ServerEvent::PersonalSync(PersonalSync { position: 3 }));
    }

    #[test]
    fn test_decode_ack_message() {
        let msg = Message::Text(r#"{"ack":2,"data":{"status":"ok"}}"#.to_string());
        assert!(matches!(decode_message(msg).unwrap(), Decoded::Ack { id: 2, .. }));
    }

    #[test]
    fn test_decode_skips_unknown_and_binary() {
        let msg = Message::Text(r#"{"event":"game_state","data":{}}"#.to_string());
        assert!(matches!(decode_message(msg).unwrap(), Decoded::Skip));
        assert!(matches!(
            decode_message(Message::Binary(vec![1, 2, 3])).unwrap(),
            Decoded::Skip
        ));
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        let msg = Message::Text(r#"{"event":"personal_sync","data":{"position":"x"}}"#.to_string());
        assert!(matches!(decode_message(msg), Err(Error::Frame(_))));
    }

    #[test]
    fn test_capacity_default() {
        assert_eq!(capacity_or_default(0), DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(capacity_or_default(8), 8);
    }
}
