//! Message tag dispatch
//!
//! Requests are looked up in a table built once at startup. Each handler
//! decodes its payload, calls into the registry and yields the value carried
//! back in the `REPLY`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{InputError, Result};
use crate::events::{EventClass, SessionId};
use crate::registry::Registry;

use super::codec::CodecError;
use super::protocol::{
    IdRequest, InterceptorRequest, KeyMonitorRequest, MarkConsumedRequest, MessageTag, MonitorRequest,
    Payload, Reply, SubscribeRequest,
};

type Handler = fn(&Registry, SessionId, &[u8]) -> Result<i32>;

impl From<CodecError> for InputError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Short => InputError::MalformedPayload("payload too short"),
            CodecError::Malformed(what) => InputError::MalformedPayload(what),
            CodecError::MalformedFrame { .. } => InputError::MalformedPayload("frame length"),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    handlers: HashMap<u32, Handler>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        let table: [(MessageTag, Handler); 12] = [
            (MessageTag::Ping, ping),
            (MessageTag::SubscribeKey, subscribe_key),
            (MessageTag::UnsubscribeKey, unsubscribe_key),
            (MessageTag::SubscribeHotkey, subscribe_hotkey),
            (MessageTag::UnsubscribeHotkey, unsubscribe_hotkey),
            (MessageTag::SubscribeKeyMonitor, subscribe_key_monitor),
            (MessageTag::UnsubscribeKeyMonitor, unsubscribe_key_monitor),
            (MessageTag::AddMonitor, add_monitor),
            (MessageTag::RemoveMonitor, remove_monitor),
            (MessageTag::AddInterceptor, add_interceptor),
            (MessageTag::RemoveInterceptor, remove_interceptor),
            (MessageTag::MarkConsumed, mark_consumed),
        ];
        let handlers = table
            .into_iter()
            .map(|(tag, handler)| (tag.as_u32(), handler))
            .collect();
        Self { registry, handlers }
    }

    /// Handle one request from `session`. Registry failures are folded into
    /// the reply; only a tag with no handler is an error.
    pub fn dispatch(&self, session: SessionId, tag: u32, payload: &[u8]) -> Result<Reply> {
        let handler = self.handlers.get(&tag).ok_or_else(|| {
            warn!(session, tag, "unknown message tag");
            InputError::UnknownMessage(tag)
        })?;

        let result = match handler(&self.registry, session, payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(session, tag, error = %e, "request failed");
                e.code()
            }
        };
        Ok(Reply { request: tag, result })
    }
}

fn ping(_: &Registry, _: SessionId, _: &[u8]) -> Result<i32> {
    Ok(0)
}

fn subscribe_key(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = SubscribeRequest::from_payload(payload)?;
    registry.subscribe_key_event(session, req.option, req.token)
}

fn unsubscribe_key(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = IdRequest::from_payload(payload)?;
    registry.unsubscribe_key_event(session, req.id).map(|()| 0)
}

fn subscribe_hotkey(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = SubscribeRequest::from_payload(payload)?;
    registry.subscribe_hotkey(session, req.option, req.token)
}

fn unsubscribe_hotkey(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = IdRequest::from_payload(payload)?;
    registry.unsubscribe_hotkey(session, req.id).map(|()| 0)
}

fn subscribe_key_monitor(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = KeyMonitorRequest::from_payload(payload)?;
    registry.subscribe_key_monitor(session, req.key, req.action, req.token)
}

fn unsubscribe_key_monitor(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = IdRequest::from_payload(payload)?;
    registry.unsubscribe_key_monitor(session, req.id).map(|()| 0)
}

fn event_classes(bits: u32) -> Result<EventClass> {
    EventClass::from_bits(bits).ok_or(InputError::InvalidParameter("event class mask"))
}

fn add_monitor(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = MonitorRequest::from_payload(payload)?;
    registry.add_monitor(session, event_classes(req.classes)?, req.token)
}

fn remove_monitor(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = IdRequest::from_payload(payload)?;
    registry.remove_monitor(session, req.id).map(|()| 0)
}

fn add_interceptor(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = InterceptorRequest::from_payload(payload)?;
    registry.add_interceptor(session, event_classes(req.classes)?, req.priority, req.token)
}

fn remove_interceptor(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = IdRequest::from_payload(payload)?;
    registry.remove_interceptor(session, req.id).map(|()| 0)
}

fn mark_consumed(registry: &Registry, session: SessionId, payload: &[u8]) -> Result<i32> {
    let req = MarkConsumedRequest::from_payload(payload)?;
    registry.mark_consumed(session, req.monitor, req.event_id).map(|()| 0)
}
