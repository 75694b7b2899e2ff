//! Async driver for [`SessionState`].
//!
//! The controller owns the channel, the state machine and its two timers.
//! One `select!` loop feeds it channel events, user commands, finished
//! background work and timer expirations, one at a time. Requests are sent
//! with [`Channel::submit`] and settled when their acknowledgement comes
//! back on the event stream, so an ack is always applied before any server
//! event that followed it on the wire.

use crate::channel::{Channel, Emitter};
use crate::events::ChannelEvent;
use crate::notify::Notifier;
use crate::permit::{bet_outcome, BetAuthorizer, PermitSigner, TokenReader};
use crate::session::{Effect, Input, SessionState, SessionView, Wallet};
use crate::{Config, Error};
use clawbet_types::api::{
    CheckBalance, JoinQueue, Move, WalletConnected, WalletDisconnected, Withdraw,
};
use clawbet_types::{Action, Request};
use ethers::utils::to_checksum;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

/// User intents accepted by a running controller.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Press(Action),
    Release(Action),
    SetBetAmount(u32),
    Bet,
    Withdraw,
    SetWallet(Option<Wallet>),
    Shutdown,
}

impl Command {
    /// The state machine input for this command. `None` for shutdown.
    fn into_input(self) -> Option<Input> {
        Some(match self {
            Command::Press(action) => Input::Press(action),
            Command::Release(action) => Input::Release(action),
            Command::SetBetAmount(amount) => Input::SetBetAmount(amount),
            Command::Bet => Input::Bet,
            Command::Withdraw => Input::Withdraw,
            Command::SetWallet(wallet) => Input::WalletChanged(wallet),
            Command::Shutdown => return None,
        })
    }
}

/// Handle to a spawned controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SessionView>,
}

impl ControllerHandle {
    pub fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("controller stopped, command dropped");
        }
    }

    /// Latest published snapshot.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }
}

/// Turns a request's acknowledgement (or failure) into a state machine input.
type Continuation = Box<dyn FnOnce(Result<Value, String>) -> Input + Send>;

/// Work finished off the loop.
enum Completion {
    Input(Input),
    /// A signed bet, ready to be submitted.
    BetSigned(JoinQueue),
    AckExpired {
        id: u64,
        event: &'static str,
    },
}

pub struct Controller<R, S, N> {
    config: Config,
    authorizer: Arc<BetAuthorizer<R, S>>,
    notifier: N,
}

impl<R: TokenReader, S: PermitSigner, N: Notifier> Controller<R, S, N> {
    pub fn new(config: Config, authorizer: BetAuthorizer<R, S>, notifier: N) -> Self {
        Self {
            config,
            authorizer: Arc::new(authorizer),
            notifier,
        }
    }

    /// Connect and run the session until shutdown.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(SessionState::new().view());
        let task = tokio::spawn(self.run(command_rx, view_tx));
        (ControllerHandle { commands, view }, task)
    }

    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        view: watch::Sender<SessionView>,
    ) {
        let (channel, mut stream) = Channel::connect(&self.config);
        let (results, mut result_rx) = mpsc::unbounded_channel();
        let period = self.config.countdown_period;
        let mut countdown = interval_at(Instant::now() + period, period);
        countdown.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut driver = Driver {
            state: SessionState::new(),
            channel: channel.clone(),
            results,
            authorizer: self.authorizer,
            notifier: self.notifier,
            view,
            pending: HashMap::new(),
            ack_timeout: self.config.ack_timeout,
            countdown,
            outcome_timeout: self.config.outcome_timeout,
            outcome_sleep: Box::pin(sleep(self.config.outcome_timeout)),
            outcome_round: None,
        };
        info!(url = %self.config.server_url, "controller started");

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(ChannelEvent::Connected) => driver.dispatch(Input::Connected),
                    Some(ChannelEvent::Disconnected) => driver.dispatch(Input::Disconnected),
                    Some(ChannelEvent::Server(event)) => driver.dispatch(Input::Server(event)),
                    Some(ChannelEvent::Ack { id, data }) => driver.settle(id, Ok(data)),
                    Some(ChannelEvent::Unanswered { id }) => {
                        driver.settle(id, Err(Error::ConnectionClosed.to_string()))
                    }
                    None => {
                        warn!("channel stopped");
                        break;
                    }
                },
                command = commands.recv() => match command.and_then(Command::into_input) {
                    Some(input) => driver.dispatch(input),
                    None => break,
                },
                Some(done) = result_rx.recv() => driver.complete(done),
                _ = driver.countdown.tick() => driver.dispatch(Input::Tick),
                _ = &mut driver.outcome_sleep, if driver.outcome_round.is_some() => {
                    if let Some(round) = driver.outcome_round.take() {
                        driver.dispatch(Input::OutcomeTimeout { round });
                    }
                }
            }
        }

        channel.close();
        info!("controller stopped");
    }
}

/// Loop-owned state: the reducer plus everything its effects touch.
struct Driver<R, S, N> {
    state: SessionState,
    channel: Channel,
    results: mpsc::UnboundedSender<Completion>,
    authorizer: Arc<BetAuthorizer<R, S>>,
    notifier: N,
    view: watch::Sender<SessionView>,
    /// Submitted requests awaiting their acknowledgement, by ack id.
    pending: HashMap<u64, Continuation>,
    ack_timeout: Duration,
    countdown: Interval,
    outcome_timeout: Duration,
    outcome_sleep: Pin<Box<Sleep>>,
    outcome_round: Option<u64>,
}

impl<R: TokenReader, S: PermitSigner, N: Notifier> Driver<R, S, N> {
    fn dispatch(&mut self, input: Input) {
        for effect in self.state.handle(input) {
            self.execute(effect);
        }
        self.view.send_replace(self.state.view());
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Input(input) => self.dispatch(input),
            Completion::BetSigned(request) => self.submit(request, |result| {
                Input::BetFinished(result.map(bet_outcome))
            }),
            Completion::AckExpired { id, event } => {
                if self.pending.contains_key(&id) {
                    let error = Error::AckTimeout {
                        event,
                        timeout: self.ack_timeout,
                    };
                    self.settle(id, Err(error.to_string()));
                }
            }
        }
    }

    /// Hand a request's result to its continuation.
    fn settle(&mut self, id: u64, result: Result<Value, String>) {
        match self.pending.remove(&id) {
            Some(continuation) => self.dispatch(continuation(result)),
            None => debug!(ack = id, "acknowledgement for a settled request"),
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::SendMove(bitmask) => {
                if let Err(err) = self.channel.emit(Move { bitmask }) {
                    debug!(error = %err, bits = bitmask.bits(), "move not sent");
                }
            }
            Effect::Handshake {
                generation,
                address,
            } => {
                let request = WalletConnected {
                    address: to_checksum(&address, None),
                };
                self.submit(request, move |result| Input::Handshake { generation, result });
            }
            Effect::WalletDisconnected => {
                if let Err(err) = self.channel.emit(WalletDisconnected {}) {
                    debug!(error = %err, "wallet_disconnected not sent");
                }
            }
            Effect::CheckBalance => self.submit(CheckBalance {}, Input::BalanceChecked),
            Effect::Withdraw => self.submit(Withdraw {}, Input::Withdrawn),
            Effect::PlaceBet { wallet, amount } => {
                let authorizer = self.authorizer.clone();
                let results = self.results.clone();
                tokio::spawn(async move {
                    let done = match authorizer.prepare(&wallet, amount).await {
                        Ok(request) => Completion::BetSigned(request),
                        Err(err) => Completion::Input(Input::BetFinished(Err(err.to_string()))),
                    };
                    let _ = results.send(done);
                });
            }
            Effect::Notify(notification) => self.notifier.notify(notification),
            Effect::Celebrate => self.notifier.celebrate(),
            Effect::StartOutcomeTimer { round } => {
                self.outcome_round = Some(round);
                self.outcome_sleep
                    .as_mut()
                    .reset(Instant::now() + self.outcome_timeout);
            }
            Effect::CancelOutcomeTimer => self.outcome_round = None,
            Effect::RestartCountdown => self.countdown.reset(),
        }
    }

    /// Send a request and park `into` until it is settled by its ack, by
    /// the link dropping, or by the ack timeout.
    fn submit<Q, F>(&mut self, request: Q, into: F)
    where
        Q: Request,
        F: FnOnce(Result<Q::Ack, String>) -> Input + Send + 'static,
    {
        let event = Q::EVENT;
        let id = match self.channel.submit(request) {
            Ok(id) => id,
            Err(err) => {
                warn!(event, error = %err, "request not sent");
                let _ = self.results.send(Completion::Input(into(Err(err.to_string()))));
                return;
            }
        };
        let continuation: Continuation = Box::new(move |result| {
            let ack = result.and_then(|data| {
                serde_json::from_value::<Q::Ack>(data).map_err(|e| e.to_string())
            });
            if let Err(error) = &ack {
                warn!(event, %error, "request failed");
            }
            into(ack)
        });
        self.pending.insert(id, continuation);

        let results = self.results.clone();
        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = results.send(Completion::AckExpired { id, event });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockServer, RecordingNotifier, StaticReader};
    use crate::notify::{Notification, ToastKind};
    use crate::permit::{PermitConfig, PermitMetadata};
    use crate::session::Phase;
    use clawbet_types::api::{GlobalSync, PersonalSync, RoundStart};
    use clawbet_types::{Bitmask, RoundCounters, RoundInfo, ServerEvent};
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Address, U256};
    use serde_json::{json, Value};
    use tokio::time::timeout;

    const OWNER_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn signer() -> LocalWallet {
        OWNER_KEY.parse::<LocalWallet>().unwrap().with_chain_id(8453u64)
    }

    fn wallet() -> Wallet {
        Wallet {
            address: signer().address(),
            chain_id: 8453,
        }
    }

    fn account(position: i64) -> Value {
        json!({
            "status": "ok",
            "data": {"position": position, "balance": 3.0, "played": 0, "won": 0, "bets": [], "withdrawals": []}
        })
    }

    struct Harness {
        server: MockServer,
        handle: ControllerHandle,
        view: watch::Receiver<SessionView>,
        notifier: RecordingNotifier,
        task: JoinHandle<()>,
    }

    impl Harness {
        /// Start a controller identified by [`wallet`] and wait for its first sync.
        async fn synced(position: i64, outcome_timeout: Duration) -> Self {
            let mut server = MockServer::start().await;
            server.reply("wallet_connected", account(position));
            let mut config = Config::new(&server.url)
                .unwrap()
                .with_reconnect_delay(Duration::from_millis(50))
                .with_ack_timeout(Duration::from_secs(2))
                .with_outcome_timeout(outcome_timeout);
            config.countdown_period = Duration::from_millis(50);

            let authorizer = BetAuthorizer::new(
                StaticReader::new(PermitMetadata {
                    name: "USD Coin".to_string(),
                    nonce: U256::zero(),
                    version: "2".to_string(),
                }),
                signer(),
                PermitConfig::new(Address::repeat_byte(0xaa), Address::repeat_byte(0xbb)),
            );
            let notifier = RecordingNotifier::default();
            let (handle, task) = Controller::new(config, authorizer, notifier.clone()).spawn();
            handle.send(Command::SetWallet(Some(wallet())));

            let frame = server.recv_event("wallet_connected").await;
            assert_eq!(frame.data, json!({"address": to_checksum(&wallet().address, None)}));
            let mut harness = Self {
                view: handle.watch(),
                server,
                handle,
                notifier,
                task,
            };
            harness.wait_for(|v| v.synced).await;
            harness
        }

        async fn wait_for(&mut self, f: impl Fn(&SessionView) -> bool) -> SessionView {
            let view = &mut self.view;
            timeout(Duration::from_secs(5), async {
                loop {
                    {
                        let current = view.borrow_and_update();
                        if f(&current) {
                            return current.clone();
                        }
                    }
                    view.changed().await.unwrap();
                }
            })
            .await
            .expect("timed out waiting for session view")
        }

        async fn start_turn(&mut self) {
            self.server.push(ServerEvent::TurnStart);
            self.wait_for(|v| v.is_playing).await;
        }

        async fn next_move(&mut self) -> u8 {
            let frame = self.server.recv_event("move").await;
            let bits = frame.data["bitmask"].as_u64().unwrap();
            Bitmask::from_bits(bits as u8).bits()
        }
    }

    #[tokio::test]
    async fn test_handshake_resent_after_reconnect() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        assert_eq!(h.handle.view().balance, 3.0);

        h.server.drop_connections();
        h.wait_for(|v| !v.link_connected).await;
        h.server.recv_event("wallet_connected").await;
        let view = h.wait_for(|v| v.link_connected && v.synced).await;
        assert_eq!(view.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_turn_with_win() {
        let mut h = Harness::synced(0, Duration::from_millis(300)).await;
        h.start_turn().await;

        h.handle.send(Command::Press(Action::Left));
        assert_eq!(h.next_move().await, 0b0_0001);
        h.handle.send(Command::Press(Action::Left));
        h.handle.send(Command::Press(Action::Grab));
        assert_eq!(h.next_move().await, 0b1_0001);

        h.server.push(ServerEvent::TurnEnd);
        assert_eq!(h.next_move().await, 0);
        h.notifier.wait_for(1).await;
        h.server.push(ServerEvent::PlayerWin);
        let view = h.wait_for(|v| v.round_won == 1).await;
        assert_eq!(view.round_played, 1);
        assert_eq!(view.phase, Phase::Idle);

        // Past the fallback window: the cancelled timer must stay silent.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let log = h.notifier.notifications();
        assert_eq!(log.len(), 2);
        let Notification::Update { toast, .. } = &log[1] else {
            panic!("expected update, got {log:?}");
        };
        assert_eq!(toast.kind, ToastKind::Success);
        assert_eq!(h.notifier.celebrations(), 1);
    }

    #[tokio::test]
    async fn test_silence_is_a_loss() {
        let mut h = Harness::synced(0, Duration::from_millis(100)).await;
        h.start_turn().await;
        h.server.push(ServerEvent::TurnEnd);

        let log = h.notifier.wait_for(2).await;
        let (
            Notification::Create { id, toast: first },
            Notification::Update { id: updated, toast },
        ) = (&log[0], &log[1])
        else {
            panic!("unexpected notifications {log:?}");
        };
        assert_eq!(first.kind, ToastKind::Loading);
        assert_eq!(id, updated);
        assert_eq!(toast.kind, ToastKind::Error);
        assert_eq!(h.handle.view().round_won, 0);
        assert_eq!(h.notifier.celebrations(), 0);
    }

    #[tokio::test]
    async fn test_bet_joins_queue() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.server
            .reply("join_queue", json!({"status": "ok", "position": 2}));
        h.handle.send(Command::SetBetAmount(3));
        h.handle.send(Command::Bet);

        let frame = h.server.recv_event("join_queue").await;
        assert_eq!(frame.data["amount"], json!(3));
        assert!(frame.data["signature"].as_str().unwrap().starts_with("0x"));
        let view = h.wait_for(|v| v.position == 2 && !v.loading).await;
        assert_eq!(view.phase, Phase::Queued);
    }

    #[tokio::test]
    async fn test_join_ack_applied_before_following_turn_start() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.server.reply_then(
            "join_queue",
            json!({"status": "ok", "position": 0}),
            [ServerEvent::TurnStart],
        );
        h.handle.send(Command::Bet);

        let view = h.wait_for(|v| v.is_playing).await;
        assert_eq!(view.position, 0);
        assert_eq!(view.phase, Phase::Playing);
        assert!(!view.loading);
    }

    #[tokio::test]
    async fn test_handshake_ack_applied_before_following_sync() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.server.reply_then(
            "wallet_connected",
            account(3),
            [ServerEvent::PersonalSync(PersonalSync { position: 1 })],
        );
        h.server.drop_connections();

        // The fresh ack seeds position 3; the sync behind it moves to 1.
        h.wait_for(|v| v.synced && v.position == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.handle.view().position, 1);
    }

    #[tokio::test]
    async fn test_unanswered_withdraw_times_out() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.handle.send(Command::Withdraw);
        h.server.recv_event("withdraw").await;

        let log = h.notifier.wait_for(1).await;
        let Notification::Create { toast, .. } = &log[0] else {
            panic!("expected toast, got {log:?}");
        };
        assert_eq!(toast.kind, ToastKind::Error);
        assert_eq!(toast.message, "no acknowledgement for withdraw within 2s");
    }

    #[tokio::test]
    async fn test_rejected_bet_notifies() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.server.reply(
            "join_queue",
            json!({"status": "error", "error": "Insufficient allowance"}),
        );
        h.handle.send(Command::Bet);
        h.server.recv_event("join_queue").await;

        let log = h.notifier.wait_for(1).await;
        let Notification::Create { toast, .. } = &log[0] else {
            panic!("expected toast, got {log:?}");
        };
        assert_eq!(toast.message, "Error: Insufficient allowance");
        let view = h.wait_for(|v| !v.loading).await;
        assert_eq!(view.position, -1);
    }

    #[tokio::test]
    async fn test_round_start_refreshes_balance() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.server.reply(
            "check_balance",
            json!({"status": "ok", "balance": 9.5, "bets": [], "withdrawals": []}),
        );
        h.server.push(ServerEvent::RoundStart(RoundStart {
            round_info: RoundInfo::new(20.0, 40.0),
        }));
        h.server.recv_event("check_balance").await;
        let view = h.wait_for(|v| v.balance == 9.5).await;
        assert_eq!(view.round_info, RoundInfo::new(20.0, 40.0));
    }

    #[tokio::test]
    async fn test_countdown_follows_global_sync() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.server.push(ServerEvent::GlobalSync(GlobalSync {
            state: RoundCounters::new(9, 4),
            round_info: Some(RoundInfo::new(20.0, 40.0)),
            queue_length: 1,
            con: true,
            seconds_left: 100,
        }));
        let view = h
            .wait_for(|v| v.claw_connected && v.seconds_left < 100)
            .await;
        assert!(view.seconds_left >= 90);
        assert_eq!(view.queue_count, 1);
    }

    #[tokio::test]
    async fn test_withdraw_zeroes_balance() {
        let mut h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.server.reply("withdraw", json!({"status": "ok"}));
        h.handle.send(Command::Withdraw);
        h.server.recv_event("withdraw").await;
        h.wait_for(|v| v.balance == 0.0).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let h = Harness::synced(-1, Duration::from_secs(6)).await;
        h.handle.shutdown();
        timeout(Duration::from_secs(5), h.task)
            .await
            .expect("controller did not stop")
            .unwrap();
    }
}
