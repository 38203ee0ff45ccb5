//! IPC message protocol definitions
//!
//! Every message is a frame (see `codec`) whose tag selects one of the
//! payloads below. Requests are answered with a `Reply` carrying the request
//! tag and a result: an id or zero on success, a negative error code on
//! failure. Deliveries are pushed without a request.

use bytes::{BufMut, BytesMut};

use crate::events::{KeyAction, KeyItem, LiveKeyEvent, PointerAction, PointerEvent, PointerSource};
use crate::hotkey::{KeyOption, MAX_PRE_KEYS};

use super::codec::{self, CodecError};

/// Message tags on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageTag {
    Ping = 1,
    Reply = 2,
    SubscribeKey = 16,
    UnsubscribeKey = 17,
    SubscribeHotkey = 18,
    UnsubscribeHotkey = 19,
    SubscribeKeyMonitor = 20,
    UnsubscribeKeyMonitor = 21,
    KeyEventDelivery = 32,
    AddMonitor = 48,
    RemoveMonitor = 49,
    AddInterceptor = 50,
    RemoveInterceptor = 51,
    MarkConsumed = 52,
    PointerEventDelivery = 64,
    HandlerKeyDelivery = 65,
}

impl MessageTag {
    pub const ALL: [MessageTag; 16] = [
        MessageTag::Ping,
        MessageTag::Reply,
        MessageTag::SubscribeKey,
        MessageTag::UnsubscribeKey,
        MessageTag::SubscribeHotkey,
        MessageTag::UnsubscribeHotkey,
        MessageTag::SubscribeKeyMonitor,
        MessageTag::UnsubscribeKeyMonitor,
        MessageTag::KeyEventDelivery,
        MessageTag::AddMonitor,
        MessageTag::RemoveMonitor,
        MessageTag::AddInterceptor,
        MessageTag::RemoveInterceptor,
        MessageTag::MarkConsumed,
        MessageTag::PointerEventDelivery,
        MessageTag::HandlerKeyDelivery,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.as_u32() == v)
    }
}

/// A message body that can be written to and read from a frame payload
pub trait Payload: Sized {
    fn encode(&self, dst: &mut BytesMut);

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError>;

    /// Frame this payload under `tag`
    fn to_frame(&self, tag: MessageTag) -> BytesMut {
        let mut payload = BytesMut::new();
        self.encode(&mut payload);
        codec::encode(tag.as_u32(), &payload)
    }

    /// Parse a complete payload
    fn from_payload(mut payload: &[u8]) -> Result<Self, CodecError> {
        Self::decode(&mut payload)
    }
}

impl Payload for KeyOption {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.pre_keys.len() as u8);
        for code in &self.pre_keys {
            dst.put_i32_le(*code);
        }
        dst.put_i32_le(self.final_key);
        codec::put_bool(dst, self.final_key_down);
        dst.put_u32_le(self.duration_ms);
        codec::put_bool(dst, self.repeat);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        let count = codec::get_u8(src)? as usize;
        if count > MAX_PRE_KEYS {
            return Err(CodecError::Malformed("pre key count"));
        }
        let mut pre_keys = Vec::with_capacity(count);
        for _ in 0..count {
            pre_keys.push(codec::get_i32(src)?);
        }
        Ok(KeyOption {
            pre_keys,
            final_key: codec::get_i32(src)?,
            final_key_down: codec::get_bool(src)?,
            duration_ms: codec::get_u32(src)?,
            repeat: codec::get_bool(src)?,
        })
    }
}

/// `SUBSCRIBE_KEY` / `SUBSCRIBE_HOTKEY`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub option: KeyOption,
    /// Client-side callback identity
    pub token: u64,
}

impl Payload for SubscribeRequest {
    fn encode(&self, dst: &mut BytesMut) {
        self.option.encode(dst);
        dst.put_u64_le(self.token);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            option: KeyOption::decode(src)?,
            token: codec::get_u64(src)?,
        })
    }
}

/// Any request naming a single entry: unsubscribe and remove messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRequest {
    pub id: i32,
}

impl Payload for IdRequest {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.id);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self { id: codec::get_i32(src)? })
    }
}

/// `SUBSCRIBE_KEY_MONITOR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMonitorRequest {
    pub key: i32,
    pub action: KeyAction,
    pub token: u64,
}

impl Payload for KeyMonitorRequest {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.key);
        dst.put_u8(self.action.to_wire());
        dst.put_u64_le(self.token);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        let key = codec::get_i32(src)?;
        let action = KeyAction::from_wire(codec::get_u8(src)?)
            .ok_or(CodecError::Malformed("key action"))?;
        Ok(Self { key, action, token: codec::get_u64(src)? })
    }
}

/// `ADD_MONITOR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorRequest {
    pub classes: u32,
    pub token: u64,
}

impl Payload for MonitorRequest {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.classes);
        dst.put_u64_le(self.token);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            classes: codec::get_u32(src)?,
            token: codec::get_u64(src)?,
        })
    }
}

/// `ADD_INTERCEPTOR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptorRequest {
    pub classes: u32,
    pub priority: i32,
    pub token: u64,
}

impl Payload for InterceptorRequest {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.classes);
        dst.put_i32_le(self.priority);
        dst.put_u64_le(self.token);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            classes: codec::get_u32(src)?,
            priority: codec::get_i32(src)?,
            token: codec::get_u64(src)?,
        })
    }
}

/// `MARK_CONSUMED`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkConsumedRequest {
    pub monitor: i32,
    pub event_id: u64,
}

impl Payload for MarkConsumedRequest {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.monitor);
        dst.put_u64_le(self.event_id);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            monitor: codec::get_i32(src)?,
            event_id: codec::get_u64(src)?,
        })
    }
}

/// `REPLY`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Tag of the request being answered
    pub request: u32,
    pub result: i32,
}

impl Payload for Reply {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.request);
        dst.put_i32_le(self.result);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            request: codec::get_u32(src)?,
            result: codec::get_i32(src)?,
        })
    }
}

impl Payload for LiveKeyEvent {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.key_code);
        dst.put_u8(self.action.to_wire());
        codec::put_bool(dst, self.repeat);
        dst.put_i64_le(self.key_down_time);
        dst.put_i64_le(self.action_time);
        dst.put_u8(self.pressed.len() as u8);
        for item in &self.pressed {
            dst.put_i32_le(item.code);
            dst.put_i64_le(item.down_time);
        }
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        let key_code = codec::get_i32(src)?;
        let action = KeyAction::from_wire(codec::get_u8(src)?)
            .ok_or(CodecError::Malformed("key action"))?;
        let repeat = codec::get_bool(src)?;
        let key_down_time = codec::get_i64(src)?;
        let action_time = codec::get_i64(src)?;
        let count = codec::get_u8(src)? as usize;
        let mut pressed = Vec::with_capacity(count);
        for _ in 0..count {
            pressed.push(KeyItem {
                code: codec::get_i32(src)?,
                down_time: codec::get_i64(src)?,
            });
        }
        Ok(Self { key_code, pressed, key_down_time, action_time, action, repeat })
    }
}

impl Payload for PointerEvent {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(match self.source {
            PointerSource::Mouse => 1,
            PointerSource::Touch => 2,
        });
        dst.put_i32_le(self.pointer_id);
        dst.put_u8(self.action.to_wire());
        dst.put_f64_le(self.x);
        dst.put_f64_le(self.y);
        dst.put_i64_le(self.action_time);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        let source = match codec::get_u8(src)? {
            1 => PointerSource::Mouse,
            2 => PointerSource::Touch,
            _ => return Err(CodecError::Malformed("pointer source")),
        };
        let pointer_id = codec::get_i32(src)?;
        let action = PointerAction::from_wire(codec::get_u8(src)?)
            .ok_or(CodecError::Malformed("pointer action"))?;
        Ok(Self {
            source,
            pointer_id,
            action,
            x: codec::get_f64(src)?,
            y: codec::get_f64(src)?,
            action_time: codec::get_i64(src)?,
        })
    }
}

/// `KEY_EVENT_DELIVERY` (target is a subscription id) and
/// `HANDLER_KEY_DELIVERY` (target is a monitor or interceptor id)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDelivery {
    pub target: i32,
    pub event_id: u64,
    pub event: LiveKeyEvent,
}

impl Payload for KeyDelivery {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.target);
        dst.put_u64_le(self.event_id);
        self.event.encode(dst);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            target: codec::get_i32(src)?,
            event_id: codec::get_u64(src)?,
            event: LiveKeyEvent::decode(src)?,
        })
    }
}

/// `POINTER_EVENT_DELIVERY`
#[derive(Debug, Clone, PartialEq)]
pub struct PointerDelivery {
    pub target: i32,
    pub event_id: u64,
    pub event: PointerEvent,
}

impl Payload for PointerDelivery {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.target);
        dst.put_u64_le(self.event_id);
        self.event.encode(dst);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            target: codec::get_i32(src)?,
            event_id: codec::get_u64(src)?,
            event: PointerEvent::decode(src)?,
        })
    }
}
