use chrono::Local;
use clawbet_client::{Notification, Notifier, Phase, SessionView, Toast, ToastId, ToastKind};
use clawbet_types::payout::round_cents;
use clawbet_types::Action;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph, Wrap};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const MAX_LOG_LINES: usize = 300;
const CELEBRATION: Duration = Duration::from_secs(2);

pub enum UiEvent {
    Notify(Notification),
    Celebrate,
}

/// Forwards notification intents to the render loop.
pub struct TerminalNotifier {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl TerminalNotifier {
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self { tx }
    }
}

impl Notifier for TerminalNotifier {
    fn notify(&mut self, notification: Notification) {
        let _ = self.tx.send(UiEvent::Notify(notification));
    }

    fn celebrate(&mut self) {
        let _ = self.tx.send(UiEvent::Celebrate);
    }
}

struct ActiveToast {
    toast: Toast,
    expires: Option<Instant>,
}

pub struct AppState {
    pub status: String,
    pub logs: Vec<String>,
    pub release_events: bool,
    toasts: BTreeMap<ToastId, ActiveToast>,
    celebrate_until: Option<Instant>,
}

impl AppState {
    pub fn new(status: String, release_events: bool) -> Self {
        Self {
            status,
            logs: Vec::new(),
            release_events,
            toasts: BTreeMap::new(),
            celebrate_until: None,
        }
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        let ts = Local::now().format("%H:%M:%S");
        self.logs.push(format!("{ts} {}", line.into()));
        if self.logs.len() > MAX_LOG_LINES {
            let excess = self.logs.len() - MAX_LOG_LINES;
            self.logs.drain(0..excess);
        }
    }

    pub fn apply(&mut self, event: UiEvent, now: Instant) {
        match event {
            UiEvent::Notify(Notification::Create { id, toast })
            | UiEvent::Notify(Notification::Update { id, toast }) => {
                self.push_log(toast.message.clone());
                let expires = toast.duration.map(|d| now + d);
                self.toasts.insert(id, ActiveToast { toast, expires });
            }
            UiEvent::Notify(Notification::Close(id)) => {
                self.toasts.remove(&id);
            }
            UiEvent::Celebrate => self.celebrate_until = Some(now + CELEBRATION),
        }
    }

    /// Drop toasts whose display time is over.
    pub fn expire(&mut self, now: Instant) {
        self.toasts
            .retain(|_, active| active.expires.is_none_or(|at| at > now));
        if self.celebrate_until.is_some_and(|until| until <= now) {
            self.celebrate_until = None;
        }
    }
}

fn toast_color(kind: ToastKind) -> Color {
    match kind {
        ToastKind::Loading => Color::Yellow,
        ToastKind::Success => Color::Green,
        ToastKind::Error => Color::Red,
    }
}

fn phase_line(view: &SessionView) -> String {
    match view.phase {
        Phase::Idle => "Not in queue. Press b to play.".to_string(),
        Phase::Queued => format!("Queued: {} turn(s) ahead of you", view.position),
        Phase::NextUp => "You're next!".to_string(),
        Phase::Playing => "YOUR TURN: arrows move, space grabs".to_string(),
    }
}

fn format_countdown(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn held_keys(view: &SessionView) -> String {
    let held: Vec<&str> = view.active_mask.held().map(|a: Action| a.as_str()).collect();
    if held.is_empty() {
        "-".to_string()
    } else {
        held.join(" + ")
    }
}

pub fn draw(f: &mut ratatui::Frame, app: &AppState, view: &SessionView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(1), Constraint::Length(3)].as_ref())
        .split(f.area());

    let link = match (view.link_connected, view.synced) {
        (false, _) => "offline",
        (true, false) => "syncing",
        (true, true) => "online",
    };
    let status = Paragraph::new(format!(
        "{} | server {} | claw {}",
        app.status,
        link,
        if view.claw_connected { "up" } else { "down" }
    ))
    .style(Style::default().fg(Color::Gray));
    f.render_widget(status, chunks[0]);

    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(chunks[1]);

    let mut title = Style::default().fg(Color::Yellow);
    if app.celebrate_until.is_some() {
        title = title.add_modifier(Modifier::BOLD | Modifier::SLOW_BLINK);
    }
    let board = List::new(board_lines(view)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(Span::styled(
                if app.celebrate_until.is_some() { "Claw: WINNER" } else { "Claw" },
                title,
            )),
    );
    f.render_widget(board, main_chunks[0]);

    let side = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(1)].as_ref())
        .split(main_chunks[1]);

    let toasts: Vec<ListItem> = app
        .toasts
        .values()
        .rev()
        .map(|active| {
            ListItem::new(Line::from(Span::styled(
                active.toast.message.clone(),
                Style::default().fg(toast_color(active.toast.kind)),
            )))
        })
        .collect();
    f.render_widget(
        List::new(toasts).block(Block::default().borders(Borders::ALL).title("Notifications")),
        side[0],
    );

    let log_lines: Vec<Line> = app
        .logs
        .iter()
        .rev()
        .take(side[1].height.saturating_sub(2) as usize)
        .rev()
        .map(|l| Line::raw(l.clone()))
        .collect();
    let log = Paragraph::new(log_lines)
        .block(Block::default().borders(Borders::ALL).title("Log"))
        .wrap(Wrap { trim: true });
    f.render_widget(log, side[1]);

    let keys = if app.release_events {
        "b bet | +/- stake | w withdraw | c wallet | q quit"
    } else {
        "b bet | +/- stake | w withdraw | c wallet | q quit | (hold keys: repeat)"
    };
    let help = Paragraph::new(keys)
        .style(Style::default().fg(Color::Gray))
        .block(Block::default().borders(Borders::ALL).title("Keys"));
    f.render_widget(help, chunks[2]);
}

fn board_lines(view: &SessionView) -> Vec<ListItem<'static>> {
    let mut lines: Vec<ListItem> = Vec::new();
    let add = |lines: &mut Vec<ListItem>, label: &str, value: String| {
        lines.push(ListItem::new(Line::from(vec![
            Span::styled(format!("{label}: "), Style::default().fg(Color::Yellow)),
            Span::raw(value),
        ])));
    };

    add(&mut lines, "Status", phase_line(view));
    add(&mut lines, "Queue", view.queue_count.to_string());
    add(&mut lines, "Held", held_keys(view));
    add(
        &mut lines,
        "Stake",
        if view.loading {
            format!("{} (signing…)", view.bet_amount)
        } else {
            view.bet_amount.to_string()
        },
    );
    add(
        &mut lines,
        "Multiplier",
        format!("x{:.2}", round_cents(view.multiplier)),
    );
    add(
        &mut lines,
        "Round",
        format!(
            "{} played / {} won",
            view.round_counters.played, view.round_counters.won
        ),
    );
    add(
        &mut lines,
        "Fees",
        format!(
            "max {}% / growth {}%",
            view.round_info.max_fee_percent, view.round_info.fee_growth_percent
        ),
    );
    add(&mut lines, "Round ends", format_countdown(view.seconds_left));
    add(
        &mut lines,
        "You",
        format!("{} played / {} won", view.round_played, view.round_won),
    );
    add(&mut lines, "Payout", format!("{:.2}", round_cents(view.payout)));
    add(&mut lines, "Balance", format!("{:.2}", round_cents(view.balance)));
    if let Some(bet) = view.bets.last() {
        add(
            &mut lines,
            "Last bet",
            format!(
                "{} {} at x{:.2}",
                bet.stake,
                if bet.won { "won" } else { "lost" },
                bet.multiplier
            ),
        );
    }
    add(
        &mut lines,
        "Wallet",
        view.wallet
            .map(|w| format!("{:#x} (chain {})", w.address, w.chain_id))
            .unwrap_or_else(|| "not connected".to_string()),
    );
    lines
}
