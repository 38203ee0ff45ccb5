//! Key code definitions and key option validation
//!
//! Provides constants for the key codes the service treats specially and
//! the `KeyOption` type describing a subscribed combination.

use std::fmt::Write as _;

use crate::error::{InputError, Result};
use crate::events::KeyAction;

/// Normalized key code as produced by the driver
pub type KeyCode = i32;

/// Most modifier keys a combination may carry
pub const MAX_PRE_KEYS: usize = 4;

/// Key codes with a fixed meaning to the service
pub mod codes {
    use super::KeyCode;

    pub const VOLUME_UP: KeyCode = 16;
    pub const VOLUME_DOWN: KeyCode = 17;
    pub const POWER: KeyCode = 18;
    pub const VOLUME_MUTE: KeyCode = 22;

    pub const A: KeyCode = 2017;
    pub const C: KeyCode = 2019;
    pub const D: KeyCode = 2020;
    pub const S: KeyCode = 2035;
    pub const V: KeyCode = 2038;

    pub const ALT_LEFT: KeyCode = 2045;
    pub const ALT_RIGHT: KeyCode = 2046;
    pub const SHIFT_LEFT: KeyCode = 2047;
    pub const SHIFT_RIGHT: KeyCode = 2048;
    pub const CTRL_LEFT: KeyCode = 2072;
    pub const CTRL_RIGHT: KeyCode = 2073;
    pub const META_LEFT: KeyCode = 2076;
    pub const META_RIGHT: KeyCode = 2077;
}

/// Keys a hotkey may use as modifiers
pub const HOTKEY_MODIFIERS: [KeyCode; 8] = [
    codes::CTRL_LEFT,
    codes::CTRL_RIGHT,
    codes::SHIFT_LEFT,
    codes::SHIFT_RIGHT,
    codes::ALT_LEFT,
    codes::ALT_RIGHT,
    codes::META_LEFT,
    codes::META_RIGHT,
];

/// Keys a key monitor may observe
pub const MONITORED_KEYS: [KeyCode; 3] = [codes::VOLUME_UP, codes::VOLUME_DOWN, codes::VOLUME_MUTE];

/// Check whether a key is one of the hotkey modifiers
pub fn is_modifier(code: KeyCode) -> bool {
    HOTKEY_MODIFIERS.contains(&code)
}

/// A key combination a client subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOption {
    /// Modifier keys that must be held, unique, at most four
    pub pre_keys: Vec<KeyCode>,
    /// Key whose transition triggers the match
    pub final_key: KeyCode,
    /// Match the down transition if set, the up transition otherwise
    pub final_key_down: bool,
    /// Completion window in milliseconds, zero for none
    pub duration_ms: u32,
    /// Also match auto-repeat downs
    pub repeat: bool,
}

impl KeyOption {
    /// Option matching `final_key` going down with the given modifiers held
    pub fn chord(pre_keys: &[KeyCode], final_key: KeyCode) -> Self {
        Self {
            pre_keys: pre_keys.to_vec(),
            final_key,
            final_key_down: true,
            duration_ms: 0,
            repeat: true,
        }
    }

    /// Option used by key monitors: a single key in one direction
    pub fn single(key: KeyCode, action: KeyAction) -> Result<Self> {
        let final_key_down = match action {
            KeyAction::Down => true,
            KeyAction::Up => false,
            KeyAction::Cancel => return Err(InputError::InvalidParameter("monitor action")),
        };
        Ok(Self {
            pre_keys: Vec::new(),
            final_key: key,
            final_key_down,
            duration_ms: 0,
            repeat: true,
        })
    }

    pub fn with_duration(mut self, duration_ms: u32) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_final_key_up(mut self) -> Self {
        self.final_key_down = false;
        self
    }

    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Deterministic registry key for this option. Options that differ only
    /// in the order of their modifiers share a canonical key.
    pub fn canonical_key(&self) -> String {
        let mut pre = self.pre_keys.clone();
        pre.sort_unstable();

        let mut key = String::with_capacity(48);
        for code in &pre {
            let _ = write!(key, "{},", code);
        }
        let _ = write!(
            key,
            "{}:{}:{}:{}",
            self.final_key,
            if self.final_key_down { 'd' } else { 'u' },
            self.duration_ms,
            u8::from(self.repeat)
        );
        key
    }

    /// Checks shared by every subscription kind
    pub fn validate(&self) -> Result<()> {
        if self.final_key < 0 {
            return Err(InputError::InvalidParameter("final key"));
        }
        if self.pre_keys.len() > MAX_PRE_KEYS {
            return Err(InputError::InvalidParameter("too many pre keys"));
        }
        for (i, code) in self.pre_keys.iter().enumerate() {
            if *code < 0 || *code == self.final_key {
                return Err(InputError::InvalidParameter("pre key"));
            }
            if self.pre_keys[..i].contains(code) {
                return Err(InputError::InvalidParameter("duplicate pre key"));
            }
        }
        Ok(())
    }

    /// Checks for system hotkeys: modifiers only from the allow-list, a
    /// non-modifier final key, down direction, no duration
    pub fn validate_hotkey(&self) -> Result<()> {
        self.validate()?;
        if self.pre_keys.is_empty() || !self.pre_keys.iter().all(|k| is_modifier(*k)) {
            return Err(InputError::InvalidParameter("hotkey modifiers"));
        }
        if is_modifier(self.final_key) {
            return Err(InputError::InvalidParameter("hotkey final key"));
        }
        if !self.final_key_down || self.duration_ms != 0 {
            return Err(InputError::InvalidParameter("hotkey direction or duration"));
        }
        Ok(())
    }

    /// Checks for key monitors: one allow-listed key, nothing else
    pub fn validate_key_monitor(&self) -> Result<()> {
        self.validate()?;
        if !MONITORED_KEYS.contains(&self.final_key) {
            return Err(InputError::InvalidParameter("key not monitorable"));
        }
        if !self.pre_keys.is_empty() || self.duration_ms != 0 {
            return Err(InputError::InvalidParameter("key monitor takes a single key"));
        }
        Ok(())
    }
}
