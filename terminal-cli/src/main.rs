mod keys;
mod ui;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use clawbet_client::{
    BetAuthorizer, Command, Config, Controller, ControllerHandle, Erc20Permit, PermitConfig,
    Wallet,
};
use clawbet_types::{MAX_BET, MIN_BET};
use crossterm::event::{
    Event as CEvent, EventStream, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement};
use directories::ProjectDirs;
use ethers::prelude::*;
use futures::StreamExt;
use keys::{HoldTracker, Intent};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, Level};
use ui::{AppState, TerminalNotifier, UiEvent};

const DEFAULT_SERVER: &str = "ws://localhost:8000/ws";
const DEFAULT_RPC: &str = "http://localhost:8545";

/// CLI flags (user-provided override persisted config)
#[derive(Parser, Debug)]
#[command(name = "clawbet-terminal", about = "Play the remote claw machine from a terminal")]
struct Args {
    /// Claw server event channel (ws(s):// or http(s)://)
    #[arg(long)]
    server: Option<String>,

    /// EVM JSON-RPC endpoint used for token reads
    #[arg(long)]
    rpc_url: Option<String>,

    /// Stablecoin (permit token) address
    #[arg(long)]
    token: Option<String>,

    /// Game contract address (permit spender)
    #[arg(long)]
    game_contract: Option<String>,

    /// Chain id; queried from the RPC endpoint when omitted
    #[arg(long)]
    chain_id: Option<u64>,

    /// Hex private key of the playing wallet (or CLAW_PRIVATE_KEY)
    #[arg(long)]
    private_key: Option<String>,

    /// Simulated hold window for terminals without key release events
    #[arg(long)]
    hold_ms: Option<u64>,

    /// Log file (defaults to the project data dir)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedConfig {
    server: Option<String>,
    rpc_url: Option<String>,
    token: Option<String>,
    game_contract: Option<String>,
    chain_id: Option<u64>,
    hold_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = load_config().unwrap_or_default();

    let server = args
        .server
        .clone()
        .or_else(|| cfg.server.clone())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let rpc_url = args
        .rpc_url
        .clone()
        .or_else(|| cfg.rpc_url.clone())
        .unwrap_or_else(|| DEFAULT_RPC.to_string());
    let token = args
        .token
        .clone()
        .or_else(|| cfg.token.clone())
        .ok_or_else(|| anyhow!("missing --token"))?;
    let game_contract = args
        .game_contract
        .clone()
        .or_else(|| cfg.game_contract.clone())
        .ok_or_else(|| anyhow!("missing --game-contract"))?;
    let hold_ms = args.hold_ms.or(cfg.hold_ms).unwrap_or(150);

    cfg.server = Some(server.clone());
    cfg.rpc_url = Some(rpc_url.clone());
    cfg.token = Some(token.clone());
    cfg.game_contract = Some(game_contract.clone());
    cfg.chain_id = args.chain_id.or(cfg.chain_id);
    cfg.hold_ms = Some(hold_ms);
    save_config(&cfg)?;

    init_logging(args.log_file.clone(), args.log_level)?;

    let token: Address = token.parse().context("parse token address")?;
    let spender: Address = game_contract.parse().context("parse game contract address")?;
    let provider = Provider::<Http>::try_from(rpc_url.as_str()).context("invalid RPC URL")?;
    let chain_id = match cfg.chain_id {
        Some(id) => id,
        None => provider
            .get_chainid()
            .await
            .context("query chain id")?
            .as_u64(),
    };

    // Without a key the terminal spectates; bets are declined.
    let key = args
        .private_key
        .clone()
        .or_else(|| std::env::var("CLAW_PRIVATE_KEY").ok());
    let identity = key.is_some();
    let signer: LocalWallet = match key {
        Some(key) => key.parse().context("parse private key")?,
        None => LocalWallet::new(&mut ethers::core::rand::thread_rng()),
    };
    let signer = signer.with_chain_id(chain_id);
    let wallet = Wallet {
        address: signer.address(),
        chain_id,
    };

    let config = Config::from_env(&server).context("invalid server URL")?;
    let authorizer = BetAuthorizer::new(
        Erc20Permit::new(token, Arc::new(provider)),
        signer,
        PermitConfig::new(token, spender),
    );
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel::<UiEvent>();
    let (handle, controller) =
        Controller::new(config, authorizer, TerminalNotifier::new(ui_tx)).spawn();
    let mut wallet_connected = identity;
    if identity {
        handle.send(Command::SetWallet(Some(wallet)));
    }
    info!(server = %server, chain_id, address = ?wallet.address, "terminal started");

    // TUI setup
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let release_events = supports_keyboard_enhancement().unwrap_or(false);
    if release_events {
        crossterm::execute!(
            stdout,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let mut app = AppState::new(format!("Server: {server} | Chain: {chain_id}"), release_events);
    app.push_log(if identity {
        "Wallet loaded, connecting…"
    } else {
        "No private key: spectating"
    });
    let mut holds = HoldTracker::new(Duration::from_millis(hold_ms));
    let mut view_rx = handle.watch();
    let mut events = EventStream::new();
    let mut tick = tokio::time::interval(Duration::from_millis(50));

    loop {
        let view = view_rx.borrow_and_update().clone();
        terminal.draw(|f| ui::draw(f, &app, &view))?;

        select! {
            maybe_ev = events.next() => {
                let Some(Ok(CEvent::Key(key))) = maybe_ev else {
                    continue;
                };
                let Some(intent) = keys::intent(&key) else {
                    continue;
                };
                match intent {
                    Intent::Quit => break,
                    Intent::Press(action) if !release_events => {
                        if holds.touch(action, Instant::now()) {
                            handle.send(Command::Press(action));
                        }
                    }
                    Intent::Press(action) => handle.send(Command::Press(action)),
                    Intent::Release(action) => handle.send(Command::Release(action)),
                    Intent::Bet => handle.send(Command::Bet),
                    Intent::RaiseBet => {
                        let amount = (view.bet_amount + 1).min(MAX_BET);
                        handle.send(Command::SetBetAmount(amount));
                    }
                    Intent::LowerBet => {
                        let amount = view.bet_amount.saturating_sub(1).max(MIN_BET);
                        handle.send(Command::SetBetAmount(amount));
                    }
                    Intent::Withdraw => handle.send(Command::Withdraw),
                    Intent::ToggleWallet => toggle_wallet(
                        &handle,
                        &mut app,
                        identity,
                        &mut wallet_connected,
                        wallet,
                    ),
                }
            }
            Some(event) = ui_rx.recv() => app.apply(event, Instant::now()),
            changed = view_rx.changed() => {
                if changed.is_err() {
                    app.push_log("Session stopped");
                    break;
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for action in holds.expire(now) {
                    handle.send(Command::Release(action));
                }
                if !view.is_playing {
                    holds.release_all();
                }
                app.expire(now);
            }
        }
    }

    handle.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), controller).await;

    if release_events {
        crossterm::execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)?;
    }
    disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen,
        crossterm::cursor::Show
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn toggle_wallet(
    handle: &ControllerHandle,
    app: &mut AppState,
    identity: bool,
    connected: &mut bool,
    wallet: Wallet,
) {
    if !identity {
        app.push_log("No private key configured");
        return;
    }
    *connected = !*connected;
    if *connected {
        app.push_log("Wallet connected");
        handle.send(Command::SetWallet(Some(wallet)));
    } else {
        app.push_log("Wallet disconnected");
        handle.send(Command::SetWallet(None));
    }
}

/// Log to a file so the TUI is not overwritten.
fn init_logging(path: Option<PathBuf>, level: Level) -> Result<()> {
    let Some(path) = path.or_else(|| data_path("terminal.log")) else {
        return Ok(());
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn load_config() -> Option<PersistedConfig> {
    let path = config_path()?;
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn save_config(cfg: &PersistedConfig) -> Result<()> {
    if let Some(path) = config_path() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        std::fs::write(path, data)?;
    }
    Ok(())
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "clawbet", "terminal")
}

fn config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.json"))
}

fn data_path(name: &str) -> Option<PathBuf> {
    project_dirs().map(|d| d.data_dir().join(name))
}
