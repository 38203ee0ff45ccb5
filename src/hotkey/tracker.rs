//! Held-key tracking
//!
//! Turns raw key transitions into `LiveKeyEvent`s carrying the full set of
//! keys held at the time of the transition.

use tracing::debug;

use crate::events::{KeyAction, KeyItem, LiveKeyEvent};

use super::keys::KeyCode;

/// Tracks which keys are currently held and since when
#[derive(Debug, Default)]
pub struct KeyStateTracker {
    pressed: Vec<KeyItem>,
}

impl KeyStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw key transition and return the normalized event.
    ///
    /// For a down event the key is part of `pressed`. For up and cancel the
    /// key is removed first, so `pressed` lists what remains held while
    /// `key_down_time` still reports when the released key went down.
    pub fn on_raw_key_event(&mut self, code: KeyCode, action: KeyAction, time: i64) -> LiveKeyEvent {
        let existing = self.pressed.iter().position(|item| item.code == code);

        let (key_down_time, repeat) = match action {
            KeyAction::Down => match existing {
                Some(idx) => (self.pressed[idx].down_time, true),
                None => {
                    self.pressed.push(KeyItem { code, down_time: time });
                    (time, false)
                }
            },
            KeyAction::Up | KeyAction::Cancel => match existing {
                Some(idx) => (self.pressed.remove(idx).down_time, false),
                None => {
                    debug!(code, ?action, "release of a key that was not held");
                    (time, false)
                }
            },
        };

        if action == KeyAction::Cancel {
            // A cancel invalidates the whole chord
            self.pressed.clear();
        }

        LiveKeyEvent {
            key_code: code,
            pressed: self.pressed.clone(),
            key_down_time,
            action_time: time,
            action,
            repeat,
        }
    }
}
