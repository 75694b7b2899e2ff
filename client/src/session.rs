//! Session state machine.
//!
//! [`SessionState`] is the only owner of queue, turn, epoch and account
//! state. It is driven by [`Input`]s and answers each one with the
//! [`Effect`]s the controller must carry out. It performs no I/O and keeps no
//! clocks, so every transition can be tested synchronously.

use crate::notify::{Notification, Toast, ToastId};
use crate::permit::BetOutcome;
use clawbet_types::api::{
    BalanceAck, BetRecord, WalletConnectedAck, WithdrawAck, WithdrawalRecord, NOT_QUEUED,
};
use clawbet_types::payout::{current_payout, marginal_multiplier};
use clawbet_types::{Action, Bitmask, RoundCounters, RoundInfo, ServerEvent, MAX_BET, MIN_BET};
use ethers::types::Address;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const CHECKING_RESULT: &str = "Checking result…";
const LOSS_MESSAGE: &str = "Better luck next time...";
const NEXT_TURN_LOSS_MESSAGE: &str = "Better luck next time!";
const WIN_MESSAGE: &str = "🎉 You won!";
const WITHDRAW_FAILED: &str = "Unexpected error while withdrawing funds...";

/// Connected wallet identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wallet {
    pub address: Address,
    pub chain_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Queued,
    NextUp,
    Playing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Queued => "queued",
            Phase::NextUp => "next_up",
            Phase::Playing => "playing",
        }
    }
}

/// Everything the state machine reacts to.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Connected,
    Disconnected,
    Server(ServerEvent),
    WalletChanged(Option<Wallet>),
    Handshake {
        generation: u64,
        result: Result<WalletConnectedAck, String>,
    },
    BetFinished(Result<BetOutcome, String>),
    BalanceChecked(Result<BalanceAck, String>),
    Withdrawn(Result<WithdrawAck, String>),
    Press(Action),
    Release(Action),
    SetBetAmount(u32),
    Bet,
    Withdraw,
    /// One countdown period elapsed.
    Tick,
    OutcomeTimeout {
        round: u64,
    },
}

/// Work the controller performs on behalf of the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    SendMove(Bitmask),
    Handshake { generation: u64, address: Address },
    WalletDisconnected,
    CheckBalance,
    Withdraw,
    PlaceBet { wallet: Wallet, amount: u32 },
    Notify(Notification),
    Celebrate,
    StartOutcomeTimer { round: u64 },
    CancelOutcomeTimer,
    RestartCountdown,
}

/// Snapshot published to the front end.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    pub phase: Phase,
    pub queue_count: u32,
    pub position: i64,
    pub is_playing: bool,
    pub active_mask: Bitmask,
    pub bet_amount: u32,
    pub loading: bool,
    pub round_counters: RoundCounters,
    pub round_info: RoundInfo,
    pub seconds_left: u64,
    pub claw_connected: bool,
    pub balance: f64,
    pub bets: Vec<BetRecord>,
    pub withdrawals: Vec<WithdrawalRecord>,
    pub round_played: u64,
    pub round_won: u64,
    pub link_connected: bool,
    pub synced: bool,
    pub wallet: Option<Wallet>,
    /// Multiplier on a win right now.
    pub multiplier: f64,
    /// This account's share of the current pool.
    pub payout: f64,
}

/// A finished turn whose result has not arrived yet.
#[derive(Clone, Copy, Debug)]
struct PendingOutcome {
    round: u64,
    toast: ToastId,
}

#[derive(Clone, Debug)]
pub struct SessionState {
    queue_count: u32,
    position: i64,
    is_playing: bool,
    mask: Bitmask,
    bet_amount: u32,
    loading: bool,

    counters: RoundCounters,
    round_info: RoundInfo,
    seconds_left: u64,
    claw_connected: bool,

    balance: f64,
    bets: Vec<BetRecord>,
    withdrawals: Vec<WithdrawalRecord>,
    round_played: u64,
    round_won: u64,

    link_connected: bool,
    synced: bool,
    handshake_generation: u64,
    wallet: Option<Wallet>,

    outcome: Option<PendingOutcome>,
    outcome_round: u64,
    next_toast: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            queue_count: 0,
            position: NOT_QUEUED,
            is_playing: false,
            mask: Bitmask::EMPTY,
            bet_amount: MIN_BET,
            loading: false,
            counters: RoundCounters::default(),
            round_info: RoundInfo::default(),
            seconds_left: 0,
            claw_connected: false,
            balance: 0.0,
            bets: Vec::new(),
            withdrawals: Vec::new(),
            round_played: 0,
            round_won: 0,
            link_connected: false,
            synced: false,
            handshake_generation: 0,
            wallet: None,
            outcome: None,
            outcome_round: 0,
            next_toast: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.is_playing {
            Phase::Playing
        } else if self.position == 0 {
            Phase::NextUp
        } else if self.position > 0 {
            Phase::Queued
        } else {
            Phase::Idle
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            phase: self.phase(),
            queue_count: self.queue_count,
            position: self.position,
            is_playing: self.is_playing,
            active_mask: self.mask,
            bet_amount: self.bet_amount,
            loading: self.loading,
            round_counters: self.counters,
            round_info: self.round_info,
            seconds_left: self.seconds_left,
            claw_connected: self.claw_connected,
            balance: self.balance,
            bets: self.bets.clone(),
            withdrawals: self.withdrawals.clone(),
            round_played: self.round_played,
            round_won: self.round_won,
            link_connected: self.link_connected,
            synced: self.synced,
            wallet: self.wallet,
            multiplier: marginal_multiplier(self.counters, self.round_info),
            payout: current_payout(self.counters, self.round_info, self.round_won),
        }
    }

    /// Apply one input and return the effects it requires, in order.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let before = self.phase();
        let mut effects = Vec::new();
        match input {
            Input::Connected => self.on_connected(&mut effects),
            Input::Disconnected => {
                self.link_connected = false;
                self.synced = false;
            }
            Input::Server(event) => self.on_server(event, &mut effects),
            Input::WalletChanged(wallet) => self.on_wallet_changed(wallet, &mut effects),
            Input::Handshake { generation, result } => {
                self.on_handshake(generation, result, &mut effects)
            }
            Input::BetFinished(result) => self.on_bet_finished(result, &mut effects),
            Input::BalanceChecked(Ok(ack)) if ack.status.is_ok() => {
                self.balance = ack.balance;
                self.replace_history(ack.bets, ack.withdrawals);
            }
            Input::BalanceChecked(Ok(_)) => warn!("check_balance rejected"),
            Input::BalanceChecked(Err(error)) => warn!(%error, "check_balance failed"),
            Input::Withdrawn(result) => self.on_withdrawn(result, &mut effects),
            Input::Press(action) => self.on_press(action, &mut effects),
            Input::Release(action) => self.on_release(action, &mut effects),
            Input::SetBetAmount(amount) => {
                self.bet_amount = amount.clamp(MIN_BET, MAX_BET);
            }
            Input::Bet => self.on_bet(&mut effects),
            Input::Withdraw => {
                if self.wallet.is_some() {
                    effects.push(Effect::Withdraw);
                } else {
                    debug!("no wallet connected, withdraw declined");
                }
            }
            Input::Tick => self.seconds_left = self.seconds_left.saturating_sub(1),
            Input::OutcomeTimeout { round } => self.on_outcome_timeout(round, &mut effects),
        }
        let after = self.phase();
        if before != after {
            info!(
                from = before.as_str(),
                to = after.as_str(),
                position = self.position,
                "phase changed"
            );
        }
        effects
    }

    fn on_connected(&mut self, effects: &mut Vec<Effect>) {
        self.link_connected = true;
        self.synced = false;
        if let Some(wallet) = self.wallet {
            self.start_handshake(wallet, effects);
        }
    }

    fn start_handshake(&mut self, wallet: Wallet, effects: &mut Vec<Effect>) {
        self.handshake_generation += 1;
        effects.push(Effect::Handshake {
            generation: self.handshake_generation,
            address: wallet.address,
        });
    }

    fn on_handshake(
        &mut self,
        generation: u64,
        result: Result<WalletConnectedAck, String>,
        effects: &mut Vec<Effect>,
    ) {
        if generation != self.handshake_generation {
            warn!(
                generation,
                current = self.handshake_generation,
                "discarding stale handshake ack"
            );
            return;
        }
        let ack = match result {
            Ok(ack) => ack,
            Err(error) => {
                warn!(%error, "handshake failed");
                return;
            }
        };
        let Some(snapshot) = ack.data.filter(|_| ack.status.is_ok()) else {
            warn!("handshake rejected");
            return;
        };
        self.set_position(snapshot.position, effects);
        self.balance = snapshot.balance;
        self.round_played = u64::from(snapshot.played);
        self.round_won = u64::from(snapshot.won);
        self.replace_history(snapshot.bets, snapshot.withdrawals);
        self.synced = true;
        info!(position = self.position, balance = self.balance, "session synced");
    }

    fn on_wallet_changed(&mut self, wallet: Option<Wallet>, effects: &mut Vec<Effect>) {
        if wallet == self.wallet {
            return;
        }
        let previous = std::mem::replace(&mut self.wallet, wallet);
        self.synced = false;

        // Account state belongs to the previous identity.
        self.set_position(NOT_QUEUED, effects);
        self.balance = 0.0;
        self.bets.clear();
        self.withdrawals.clear();
        self.round_played = 0;
        self.round_won = 0;

        if !self.link_connected {
            return;
        }
        match wallet {
            Some(wallet) => self.start_handshake(wallet, effects),
            None if previous.is_some() => effects.push(Effect::WalletDisconnected),
            None => {}
        }
    }

    fn on_server(&mut self, event: ServerEvent, effects: &mut Vec<Effect>) {
        match event {
            ServerEvent::PlayerQueued => {
                self.queue_count = self.queue_count.saturating_add(1);
            }
            ServerEvent::TurnStart => {
                // The next turn closes the previous turn's result window.
                if let Some(pending) = self.outcome.take() {
                    info!(round = pending.round, "next turn started without a win");
                    effects.push(Effect::CancelOutcomeTimer);
                    effects.push(Effect::Notify(Notification::Update {
                        id: pending.toast,
                        toast: Toast {
                            duration: Some(Duration::from_secs(1)),
                            ..Toast::error(NEXT_TURN_LOSS_MESSAGE)
                        },
                    }));
                }
                if self.position == 0 && !self.is_playing {
                    self.is_playing = true;
                    info!("turn started");
                }
            }
            ServerEvent::TurnEnd => self.on_turn_end(effects),
            ServerEvent::PlayerWin => self.on_player_win(effects),
            ServerEvent::GlobalSync(sync) => {
                self.counters = sync.state;
                if let Some(info) = sync.round_info {
                    self.round_info = info;
                }
                self.queue_count = sync.queue_length;
                self.claw_connected = sync.con;
                self.seconds_left = sync.seconds_left;
                effects.push(Effect::RestartCountdown);
            }
            ServerEvent::PersonalSync(sync) => self.set_position(sync.position, effects),
            ServerEvent::ClawConnectionChange(change) => {
                if self.claw_connected != change.con {
                    info!(connected = change.con, "claw link changed");
                }
                self.claw_connected = change.con;
            }
            ServerEvent::Balance(update) => {
                self.balance = update.balance;
                self.replace_history(update.bets, update.withdrawals);
            }
            ServerEvent::RoundStart(start) => {
                self.round_played = 0;
                self.round_won = 0;
                self.counters = RoundCounters::default();
                self.round_info = start.round_info;
                info!("new round");
                effects.push(Effect::CheckBalance);
            }
        }
    }

    fn on_turn_end(&mut self, effects: &mut Vec<Effect>) {
        let was_playing = self.is_playing;
        self.queue_count = self.queue_count.saturating_sub(1);
        if self.position >= 0 {
            self.position -= 1;
        }
        self.stop_playing(effects);
        if !was_playing {
            return;
        }

        self.round_played += 1;
        if let Some(previous) = self.outcome.take() {
            effects.push(Effect::Notify(Notification::Update {
                id: previous.toast,
                toast: loss_toast(),
            }));
        }
        self.outcome_round += 1;
        let toast = self.next_toast_id();
        self.outcome = Some(PendingOutcome {
            round: self.outcome_round,
            toast,
        });
        effects.push(Effect::Notify(Notification::Create {
            id: toast,
            toast: Toast::loading(CHECKING_RESULT),
        }));
        effects.push(Effect::StartOutcomeTimer {
            round: self.outcome_round,
        });
    }

    fn on_player_win(&mut self, effects: &mut Vec<Effect>) {
        let Some(pending) = self.outcome.take() else {
            debug!("player_win with no pending outcome");
            return;
        };
        self.round_won += 1;
        info!(round = pending.round, "turn won");
        effects.push(Effect::CancelOutcomeTimer);
        effects.push(Effect::Celebrate);
        effects.push(Effect::Notify(Notification::Update {
            id: pending.toast,
            toast: Toast {
                duration: Some(Duration::from_secs(1)),
                ..Toast::success(WIN_MESSAGE)
            },
        }));
    }

    fn on_outcome_timeout(&mut self, round: u64, effects: &mut Vec<Effect>) {
        match self.outcome {
            Some(pending) if pending.round == round => {
                self.outcome = None;
                info!(round, "no win reported");
                effects.push(Effect::Notify(Notification::Update {
                    id: pending.toast,
                    toast: loss_toast(),
                }));
            }
            _ => debug!(round, "ignoring expired outcome timer"),
        }
    }

    fn on_press(&mut self, action: Action, effects: &mut Vec<Effect>) {
        if !self.is_playing || !self.synced {
            trace!(action = action.as_str(), "ignoring press");
            return;
        }
        if let Some(mask) = self.mask.press(action) {
            self.mask = mask;
            effects.push(Effect::SendMove(mask));
        }
    }

    fn on_release(&mut self, action: Action, effects: &mut Vec<Effect>) {
        if !self.is_playing {
            return;
        }
        if let Some(mask) = self.mask.release(action) {
            self.mask = mask;
            effects.push(Effect::SendMove(mask));
        }
    }

    fn on_bet(&mut self, effects: &mut Vec<Effect>) {
        if self.loading {
            debug!("bet already in flight");
            return;
        }
        let Some(wallet) = self.wallet else {
            debug!("no wallet connected, bet declined");
            return;
        };
        self.loading = true;
        effects.push(Effect::PlaceBet {
            wallet,
            amount: self.bet_amount,
        });
    }

    fn on_bet_finished(&mut self, result: Result<BetOutcome, String>, effects: &mut Vec<Effect>) {
        self.loading = false;
        let error = match result {
            Ok(BetOutcome::Skipped) => return,
            Ok(BetOutcome::Queued { position }) => {
                self.set_position(position, effects);
                return;
            }
            Ok(BetOutcome::Rejected { error }) | Err(error) => error,
        };
        warn!(%error, "bet failed");
        let id = self.next_toast_id();
        effects.push(Effect::Notify(Notification::Create {
            id,
            toast: Toast {
                duration: Some(Duration::from_millis(2500)),
                ..Toast::error(format!("Error: {error}"))
            },
        }));
    }

    fn on_withdrawn(&mut self, result: Result<WithdrawAck, String>, effects: &mut Vec<Effect>) {
        let error = match result {
            Ok(ack) if ack.status.is_ok() => {
                info!(amount = self.balance, "withdrawal accepted");
                self.balance = 0.0;
                return;
            }
            Ok(ack) => ack.error.unwrap_or_else(|| WITHDRAW_FAILED.to_string()),
            Err(error) => error,
        };
        warn!(%error, "withdraw failed");
        let id = self.next_toast_id();
        effects.push(Effect::Notify(Notification::Create {
            id,
            toast: Toast::error(error),
        }));
    }

    /// Adopt an authoritative position. Leaving the queue ends any turn.
    fn set_position(&mut self, position: i64, effects: &mut Vec<Effect>) {
        self.position = position.max(NOT_QUEUED);
        if self.position == NOT_QUEUED {
            self.stop_playing(effects);
        }
    }

    fn stop_playing(&mut self, effects: &mut Vec<Effect>) {
        self.is_playing = false;
        if !self.mask.is_empty() {
            self.mask = Bitmask::EMPTY;
            effects.push(Effect::SendMove(Bitmask::EMPTY));
        }
    }

    fn replace_history(
        &mut self,
        bets: Option<Vec<BetRecord>>,
        withdrawals: Option<Vec<WithdrawalRecord>>,
    ) {
        if let Some(bets) = bets {
            self.bets = bets;
        }
        if let Some(withdrawals) = withdrawals {
            self.withdrawals = withdrawals;
        }
    }

    fn next_toast_id(&mut self) -> ToastId {
        self.next_toast += 1;
        ToastId(self.next_toast)
    }
}

fn loss_toast() -> Toast {
    Toast {
        duration: Some(Duration::from_secs(6)),
        ..Toast::error(LOSS_MESSAGE)
    }
}
