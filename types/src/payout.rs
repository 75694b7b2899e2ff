//! Epoch pool accounting.
//!
//! Every play adds one stake to the epoch pool. Winners split the pool minus
//! the house commission, so the value of a win depends on how many plays and
//! wins the epoch has seen so far.

use serde::{Deserialize, Serialize};

/// Aggregate outcomes for the current epoch. On the wire: `[played, won]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct RoundCounters {
    pub played: u64,
    pub won: u64,
}

impl RoundCounters {
    pub const fn new(played: u64, won: u64) -> Self {
        Self { played, won }
    }
}

impl From<(u64, u64)> for RoundCounters {
    fn from((played, won): (u64, u64)) -> Self {
        Self { played, won }
    }
}

impl From<RoundCounters> for (u64, u64) {
    fn from(counters: RoundCounters) -> Self {
        (counters.played, counters.won)
    }
}

/// Fee curve parameters for the current epoch. On the wire: `[max_fee, fee_growth]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct RoundInfo {
    /// Flat cap on commission, as a percentage of plays.
    pub max_fee_percent: f64,
    /// Commission growth, as a percentage of losing plays.
    pub fee_growth_percent: f64,
}

impl RoundInfo {
    pub const fn new(max_fee_percent: f64, fee_growth_percent: f64) -> Self {
        Self {
            max_fee_percent,
            fee_growth_percent,
        }
    }
}

impl From<(f64, f64)> for RoundInfo {
    fn from((max_fee_percent, fee_growth_percent): (f64, f64)) -> Self {
        Self {
            max_fee_percent,
            fee_growth_percent,
        }
    }
}

impl From<RoundInfo> for (f64, f64) {
    fn from(info: RoundInfo) -> Self {
        (info.max_fee_percent, info.fee_growth_percent)
    }
}

/// Stakes the house keeps out of the pool.
///
/// With no plays there is nothing to keep; with plays but no winner there is
/// nobody to pay, so the whole pool is commission.
pub fn effective_commission(state: RoundCounters, info: RoundInfo) -> f64 {
    if state.played == 0 {
        return 0.0;
    }
    if state.won == 0 {
        return state.played as f64;
    }
    let played = state.played as f64;
    let lost = state.played.saturating_sub(state.won) as f64;
    let flat = info.max_fee_percent * played / 100.0;
    let growth = info.fee_growth_percent * lost / 100.0;
    flat.min(growth)
}

/// Multiplier a player would realize if their next play were a win.
pub fn marginal_multiplier(state: RoundCounters, info: RoundInfo) -> f64 {
    let next = RoundCounters::new(
        state.played.saturating_add(1),
        state.won.saturating_add(1),
    );
    let commission = effective_commission(next, info);
    let loot = next.played as f64 - commission;
    loot / next.won as f64
}

/// Share of the current pool owed to a player holding `player_wins` wins.
pub fn current_payout(state: RoundCounters, info: RoundInfo, player_wins: u64) -> f64 {
    let commission = effective_commission(state, info);
    let loot = state.played as f64 - commission;
    player_wins as f64 * loot / state.won.max(1) as f64
}

/// Round to cents for display.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
