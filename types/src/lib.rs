pub mod api;
pub use api::{Frame, Inbound, Notice, Request, ServerEvent};
pub mod input;
pub use input::{Action, Bitmask};
pub mod payout;
pub use payout::{RoundCounters, RoundInfo};

/// Smallest stake a player can choose.
pub const MIN_BET: u32 = 1;

/// Largest stake a player can choose.
pub const MAX_BET: u32 = 1_000;

/// How long a signed entry permit stays valid.
pub const PERMIT_VALIDITY_SECS: u64 = 86_400;
