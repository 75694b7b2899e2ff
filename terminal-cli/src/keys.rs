//! Keyboard mapping.
//!
//! Terminals that report key releases drive press/release directly. Others
//! only report presses (and auto-repeat), so a held key is simulated: each
//! press keeps the action held for a short window, refreshed by repeats.

use clawbet_types::Action;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// What a key means to the app.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    Press(Action),
    Release(Action),
    Bet,
    RaiseBet,
    LowerBet,
    Withdraw,
    ToggleWallet,
    Quit,
}

/// Key names shared with the browser front end, so every client maps
/// controls through [`Action::from_key`].
fn key_name(code: KeyCode) -> Option<&'static str> {
    match code {
        KeyCode::Left => Some("ArrowLeft"),
        KeyCode::Right => Some("ArrowRight"),
        KeyCode::Up => Some("ArrowUp"),
        KeyCode::Down => Some("ArrowDown"),
        KeyCode::Char(' ') => Some(" "),
        _ => None,
    }
}

pub fn control_action(code: KeyCode) -> Option<Action> {
    key_name(code).and_then(Action::from_key)
}

/// Map a key event. Repeats of a control key map to a press, which the
/// session ignores when the action is already held.
pub fn intent(event: &KeyEvent) -> Option<Intent> {
    if let Some(action) = control_action(event.code) {
        return Some(match event.kind {
            KeyEventKind::Release => Intent::Release(action),
            KeyEventKind::Press | KeyEventKind::Repeat => Intent::Press(action),
        });
    }
    if event.kind == KeyEventKind::Release {
        return None;
    }
    match (event.code, event.modifiers) {
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => Some(Intent::Quit),
        (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => Some(Intent::Quit),
        (KeyCode::Char('b'), _) | (KeyCode::Enter, _) => Some(Intent::Bet),
        (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => Some(Intent::RaiseBet),
        (KeyCode::Char('-'), _) => Some(Intent::LowerBet),
        (KeyCode::Char('w'), _) => Some(Intent::Withdraw),
        (KeyCode::Char('c'), _) => Some(Intent::ToggleWallet),
        _ => None,
    }
}

/// Simulated key holds for terminals without release events.
#[derive(Debug)]
pub struct HoldTracker {
    window: Duration,
    held: BTreeMap<Action, Instant>,
}

impl HoldTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            held: BTreeMap::new(),
        }
    }

    /// Extend the hold on `action`. Returns true if it was not held before.
    pub fn touch(&mut self, action: Action, now: Instant) -> bool {
        self.held.insert(action, now + self.window).is_none()
    }

    /// Drop and return every hold whose window has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Action> {
        let expired: Vec<Action> = self
            .held
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(action, _)| *action)
            .collect();
        for action in &expired {
            self.held.remove(action);
        }
        expired
    }

    pub fn release_all(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.held).into_keys().collect()
    }
}
