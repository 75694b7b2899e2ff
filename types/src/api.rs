//! Event channel contract between a player client and the claw server.
//!
//! Every message travels as one JSON text [`Frame`]. Requests carry an `ack`
//! id that the server echoes on its reply; notices and server events do not.

use crate::input::Bitmask;
use crate::payout::{RoundCounters, RoundInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Position reported for a client that is not in the queue.
pub const NOT_QUEUED: i64 = -1;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has neither an event name nor an ack id")]
    Empty,
}

/// One message on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Reply to the request that carried `id`.
    Ack { id: u64, data: Value },
    /// Named event, possibly carrying an ack id when sent by a peer that expects a reply.
    Event {
        name: String,
        data: Value,
        ack: Option<u64>,
    },
}

impl Frame {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self {
            event: Some(name.into()),
            data,
            ack: None,
        }
    }

    pub fn request(name: impl Into<String>, data: Value, ack: u64) -> Self {
        Self {
            event: Some(name.into()),
            data,
            ack: Some(ack),
        }
    }

    pub fn reply(ack: u64, data: Value) -> Self {
        Self {
            event: None,
            data,
            ack: Some(ack),
        }
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Inbound, FrameError> {
        let frame: Frame = serde_json::from_str(text)?;
        match (frame.event, frame.ack) {
            (Some(name), ack) => Ok(Inbound::Event {
                name,
                data: frame.data,
                ack,
            }),
            (None, Some(id)) => Ok(Inbound::Ack {
                id,
                data: frame.data,
            }),
            (None, None) => Err(FrameError::Empty),
        }
    }
}

/// Outbound message that expects an acknowledgement.
pub trait Request: Serialize + Send + 'static {
    const EVENT: &'static str;
    type Ack: DeserializeOwned + Send + 'static;
}

/// Outbound fire-and-forget message.
pub trait Notice: Serialize + Send + 'static {
    const EVENT: &'static str;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    #[default]
    Error,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BetRecord {
    pub stake: f64,
    pub won: bool,
    #[serde(default)]
    pub multiplier: f64,
    #[serde(alias = "playedAt")]
    pub played_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub amount: f64,
    pub timestamp: String,
}

// ---------- Client -> server ----------

/// Identity handshake, re-sent on every (re)connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletConnected {
    pub address: String,
}

impl Request for WalletConnected {
    const EVENT: &'static str = "wallet_connected";
    type Ack = WalletConnectedAck;
}

/// Account snapshot returned by the handshake.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub position: i64,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub played: u32,
    #[serde(default)]
    pub won: u32,
    #[serde(default)]
    pub bets: Option<Vec<BetRecord>>,
    #[serde(default)]
    pub withdrawals: Option<Vec<WithdrawalRecord>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletConnectedAck {
    pub status: Status,
    #[serde(default)]
    pub data: Option<AccountSnapshot>,
}

/// Sent when the wallet is removed while the channel is up.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletDisconnected {}

impl Notice for WalletDisconnected {
    const EVENT: &'static str = "wallet_disconnected";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinQueue {
    pub address: String,
    pub amount: u32,
    pub deadline: u64,
    pub signature: String,
}

impl Request for JoinQueue {
    const EVENT: &'static str = "join_queue";
    type Ack = JoinQueueAck;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinQueueAck {
    pub status: Status,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub bitmask: Bitmask,
}

impl Notice for Move {
    const EVENT: &'static str = "move";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Withdraw {}

impl Request for Withdraw {
    const EVENT: &'static str = "withdraw";
    type Ack = WithdrawAck;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WithdrawAck {
    pub status: Status,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckBalance {}

impl Request for CheckBalance {
    const EVENT: &'static str = "check_balance";
    type Ack = BalanceAck;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceAck {
    pub status: Status,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub bets: Option<Vec<BetRecord>>,
    #[serde(default)]
    pub withdrawals: Option<Vec<WithdrawalRecord>>,
}

// ---------- Server -> client ----------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalSync {
    pub state: RoundCounters,
    #[serde(default)]
    pub round_info: Option<RoundInfo>,
    pub queue_length: u32,
    #[serde(default)]
    pub con: bool,
    #[serde(default)]
    pub seconds_left: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalSync {
    pub position: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClawConnection {
    pub con: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub balance: f64,
    #[serde(default)]
    pub bets: Option<Vec<BetRecord>>,
    #[serde(default)]
    pub withdrawals: Option<Vec<WithdrawalRecord>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundStart {
    pub round_info: RoundInfo,
}

/// Events pushed by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    PlayerQueued,
    TurnStart,
    TurnEnd,
    PlayerWin,
    GlobalSync(GlobalSync),
    PersonalSync(PersonalSync),
    ClawConnectionChange(ClawConnection),
    Balance(BalanceUpdate),
    RoundStart(RoundStart),
}

impl ServerEvent {
    pub const NAMES: [&'static str; 9] = [
        "player_queued",
        "turn_start",
        "turn_end",
        "player_win",
        "global_sync",
        "personal_sync",
        "claw_connection_change",
        "balance",
        "round_start",
    ];

    /// Decode a named event. Returns `Ok(None)` for events this client does not know.
    pub fn from_parts(name: &str, data: Value) -> Result<Option<Self>, FrameError> {
        if !Self::NAMES.contains(&name) {
            return Ok(None);
        }
        let tagged = serde_json::json!({ "event": name, "data": data });
        Ok(Some(serde_json::from_value(tagged)?))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PlayerQueued => "player_queued",
            ServerEvent::TurnStart => "turn_start",
            ServerEvent::TurnEnd => "turn_end",
            ServerEvent::PlayerWin => "player_win",
            ServerEvent::GlobalSync(_) => "global_sync",
            ServerEvent::PersonalSync(_) => "personal_sync",
            ServerEvent::ClawConnectionChange(_) => "claw_connection_change",
            ServerEvent::Balance(_) => "balance",
            ServerEvent::RoundStart(_) => "round_start",
        }
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        let data = match self {
            ServerEvent::PlayerQueued
            | ServerEvent::TurnStart
            | ServerEvent::TurnEnd
            | ServerEvent::PlayerWin => Value::Null,
            ServerEvent::GlobalSync(sync) => serde_json::to_value(sync)?,
            ServerEvent::PersonalSync(sync) => serde_json::to_value(sync)?,
            ServerEvent::ClawConnectionChange(con) => serde_json::to_value(con)?,
            ServerEvent::Balance(balance) => serde_json::to_value(balance)?,
            ServerEvent::RoundStart(round) => serde_json::to_value(round)?,
        };
        Ok(Frame::event(self.name(), data))
    }
}
