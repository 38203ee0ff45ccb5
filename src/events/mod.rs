//! Normalized input events and session lifecycle events
//!
//! Key and pointer events arrive from the driver side already normalized.
//! Session events are broadcast by the transport when clients come and go.

use serde::{Deserialize, Serialize};

use crate::hotkey::KeyCode;

/// Process-unique identifier of one dispatched input event
pub type EventId = u64;

/// Identifier of a connected client session
pub type SessionId = u64;

/// Direction of a key event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Down,
    Up,
    Cancel,
}

impl KeyAction {
    pub fn to_wire(self) -> u8 {
        match self {
            KeyAction::Down => 1,
            KeyAction::Up => 2,
            KeyAction::Cancel => 3,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(KeyAction::Down),
            2 => Some(KeyAction::Up),
            3 => Some(KeyAction::Cancel),
            _ => None,
        }
    }
}

/// A key that is currently held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyItem {
    pub code: KeyCode,
    /// Time the key went down, in microseconds
    pub down_time: i64,
}

/// Key event as seen by the matcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveKeyEvent {
    /// Code of the key that changed state
    pub key_code: KeyCode,
    /// Every key down at the time of the event
    pub pressed: Vec<KeyItem>,
    /// Time `key_code` went down, in microseconds
    pub key_down_time: i64,
    /// Time of this event, in microseconds
    pub action_time: i64,
    pub action: KeyAction,
    /// Set for auto-repeat downs of a key that is already held
    pub repeat: bool,
}

impl LiveKeyEvent {
    /// Codes of every key currently held
    pub fn pressed_codes(&self) -> impl Iterator<Item = KeyCode> + '_ {
        self.pressed.iter().map(|item| item.code)
    }
}

/// Source class of a pointer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerSource {
    Mouse,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerAction {
    Down,
    Move,
    Up,
    Cancel,
}

impl PointerAction {
    pub fn to_wire(self) -> u8 {
        match self {
            PointerAction::Down => 1,
            PointerAction::Move => 2,
            PointerAction::Up => 3,
            PointerAction::Cancel => 4,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(PointerAction::Down),
            2 => Some(PointerAction::Move),
            3 => Some(PointerAction::Up),
            4 => Some(PointerAction::Cancel),
            _ => None,
        }
    }
}

/// Mouse or touch event
#[derive(Debug, Clone, PartialEq)]
pub struct PointerEvent {
    pub source: PointerSource,
    pub pointer_id: i32,
    pub action: PointerAction,
    pub x: f64,
    pub y: f64,
    /// Time of this event, in microseconds
    pub action_time: i64,
}

/// Set of event classes a monitor or interceptor declares interest in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventClass(u32);

impl EventClass {
    pub const KEY: EventClass = EventClass(1);
    pub const MOUSE: EventClass = EventClass(1 << 1);
    pub const TOUCH: EventClass = EventClass(1 << 2);
    pub const ALL: EventClass = EventClass(0b111);

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits == 0 || bits & !Self::ALL.0 != 0 {
            return None;
        }
        Some(EventClass(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn union(self, other: EventClass) -> EventClass {
        EventClass(self.0 | other.0)
    }

    pub fn intersects(self, other: EventClass) -> bool {
        self.0 & other.0 != 0
    }
}

/// Payload of a normalized input event
#[derive(Debug, Clone, PartialEq)]
pub enum InputKind {
    Key(LiveKeyEvent),
    Pointer(PointerEvent),
}

/// Normalized input event entering the distribution pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct InputEvent {
    pub id: EventId,
    pub kind: InputKind,
}

impl InputEvent {
    pub fn key(id: EventId, event: LiveKeyEvent) -> Self {
        Self { id, kind: InputKind::Key(event) }
    }

    pub fn pointer(id: EventId, event: PointerEvent) -> Self {
        Self { id, kind: InputKind::Pointer(event) }
    }

    /// The single class this event belongs to
    pub fn class(&self) -> EventClass {
        match &self.kind {
            InputKind::Key(_) => EventClass::KEY,
            InputKind::Pointer(p) => match p.source {
                PointerSource::Mouse => EventClass::MOUSE,
                PointerSource::Touch => EventClass::TOUCH,
            },
        }
    }
}

/// Events emitted by the transport as clients connect and disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A client connected
    Connected {
        session: SessionId,
        /// Peer process id when the platform reports it
        pid: Option<i32>,
    },

    /// A client went away and everything it owned was released
    Disconnected {
        session: SessionId,
        /// Number of registry entries released by the teardown
        released: usize,
    },
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Connected { session, pid: Some(pid) } => {
                write!(f, "SESSION_CONNECTED ({} pid={})", session, pid)
            }
            SessionEvent::Connected { session, pid: None } => {
                write!(f, "SESSION_CONNECTED ({})", session)
            }
            SessionEvent::Disconnected { session, released } => {
                write!(f, "SESSION_DISCONNECTED ({} released={})", session, released)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_event_serialization() {
        let event = SessionEvent::Disconnected { session: 4, released: 3 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("disconnected"));
        assert!(json.contains("\"released\":3"));
    }

    #[test]
    fn test_session_event_deserialization() {
        let json = r#"{"type":"connected","session":9,"pid":null}"#;
        let event: SessionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, SessionEvent::Connected { session: 9, pid: None });
    }

    #[test]
    fn test_event_class_bits() {
        assert!(EventClass::from_bits(0).is_none());
        assert!(EventClass::from_bits(8).is_none());
        let pointer = EventClass::MOUSE.union(EventClass::TOUCH);
        assert!(pointer.intersects(EventClass::TOUCH));
        assert!(!pointer.intersects(EventClass::KEY));
        assert_eq!(EventClass::from_bits(pointer.bits()), Some(pointer));
    }

    #[test]
    fn test_input_event_class() {
        let touch = InputEvent::pointer(
            1,
            PointerEvent {
                source: PointerSource::Touch,
                pointer_id: 0,
                action: PointerAction::Down,
                x: 1.0,
                y: 2.0,
                action_time: 10,
            },
        );
        assert_eq!(touch.class(), EventClass::TOUCH);
    }
}
