//! Claw control inputs.
//!
//! Every held direction (and the grab button) is one bit of a [`Bitmask`]. The
//! server only ever sees the whole mask, so a press or release that does not
//! change the mask must not produce a message.

use serde::{Deserialize, Serialize};

/// Bits that can be set in a movement mask.
pub const MASK_BITS: u8 = 0b1_1111;

/// A discrete control action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Left,
    Right,
    Up,
    Down,
    Grab,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Left,
        Action::Right,
        Action::Up,
        Action::Down,
        Action::Grab,
    ];

    pub const fn bit(self) -> u8 {
        match self {
            Action::Left => 0b0_0001,
            Action::Right => 0b0_0010,
            Action::Up => 0b0_0100,
            Action::Down => 0b0_1000,
            Action::Grab => 0b1_0000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Left => "left",
            Action::Right => "right",
            Action::Up => "up",
            Action::Down => "down",
            Action::Grab => "grab",
        }
    }

    /// Map a browser-style key name (`KeyboardEvent.key`) to an action.
    pub fn from_key(key: &str) -> Option<Action> {
        match key {
            "ArrowLeft" => Some(Action::Left),
            "ArrowRight" => Some(Action::Right),
            "ArrowUp" => Some(Action::Up),
            "ArrowDown" => Some(Action::Down),
            " " | "Space" | "Spacebar" => Some(Action::Grab),
            _ => None,
        }
    }
}

/// Set of currently held actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bitmask(u8);

impl Bitmask {
    pub const EMPTY: Bitmask = Bitmask(0);

    /// Build a mask from raw bits, dropping anything outside [`MASK_BITS`].
    pub const fn from_bits(bits: u8) -> Self {
        Bitmask(bits & MASK_BITS)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    /// Returns the new mask if `action` was not already held.
    pub fn press(self, action: Action) -> Option<Bitmask> {
        if self.contains(action) {
            return None;
        }
        Some(Bitmask(self.0 | action.bit()))
    }

    /// Returns the new mask if `action` was held.
    pub fn release(self, action: Action) -> Option<Bitmask> {
        if !self.contains(action) {
            return None;
        }
        Some(Bitmask(self.0 & !action.bit()))
    }

    pub fn held(self) -> impl Iterator<Item = Action> {
        Action::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

impl From<Bitmask> for u8 {
    fn from(mask: Bitmask) -> Self {
        mask.0
    }
}
