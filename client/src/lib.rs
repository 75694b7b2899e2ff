pub mod channel;
pub mod config;
pub mod controller;
pub mod events;
pub mod notify;
pub mod permit;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use channel::{Channel, Emitter};
pub use config::Config;
pub use controller::{Command, Controller, ControllerHandle};
pub use events::{ChannelEvent, Stream};
pub use notify::{Notification, Notifier, Toast, ToastId, ToastKind, TracingNotifier};
pub use permit::{
    bet_outcome, BetAuthorizer, BetOutcome, Erc20Permit, PermitConfig, PermitMetadata,
    PermitSigner, TokenReader,
};
pub use session::{Effect, Input, Phase, SessionState, SessionView, Wallet};

use std::time::Duration;
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid frame: {0}")]
    Frame(#[from] clawbet_types::api::FrameError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected ws, wss, http or https)")]
    InvalidScheme(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no acknowledgement for {event} within {timeout:?}")]
    AckTimeout {
        event: &'static str,
        timeout: Duration,
    },
    #[error("token read failed: {0}")]
    Contract(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("typed data error: {0}")]
    TypedData(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
