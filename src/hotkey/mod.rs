//! Key combination handling
//!
//! Key option definitions, the combination matcher, held-key tracking and
//! the listener thread feeding normalized events to the pipeline.

mod keys;
mod listener;
mod matcher;
mod tracker;

pub use keys::{codes, is_modifier, KeyCode, KeyOption, HOTKEY_MODIFIERS, MAX_PRE_KEYS, MONITORED_KEYS};
pub use listener::{InputListener, ListenerError};
pub use matcher::matches;
pub use tracker::KeyStateTracker;
