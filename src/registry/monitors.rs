//! Event monitors and interceptors

use tracing::{debug, info};

use crate::error::{InputError, Result};
use crate::events::{EventClass, EventId, SessionId};

use super::{HandlerId, InterceptorEntry, MonitorEntry, Registry};

impl Registry {
    /// Receive a copy of every event of the given classes
    pub fn add_monitor(&self, session: SessionId, classes: EventClass, token: u64) -> Result<HandlerId> {
        self.with_state(|state| {
            if !state.sessions.contains_key(&session) {
                return Err(InputError::SessionGone);
            }
            let id = state.next_handler_id()?;
            let callback = self.acquire_callback(session, token);
            state.monitors.push(MonitorEntry { id, session, classes, callback });
            info!(session, id, classes = classes.bits(), "monitor added");
            Ok(id)
        })
    }

    pub fn remove_monitor(&self, session: SessionId, id: HandlerId) -> Result<()> {
        self.with_state(|state| {
            let idx = state
                .monitors
                .iter()
                .position(|m| m.id == id && m.session == session)
                .ok_or(InputError::NotFound)?;
            let monitor = state.monitors.remove(idx);
            self.callbacks.release(monitor.callback);
            info!(session, id, "monitor removed");
            Ok::<(), InputError>(())
        })?;
        self.signal_consumption();
        Ok(())
    }

    /// Take exclusive delivery of the given classes. Higher priorities are
    /// served first.
    pub fn add_interceptor(
        &self,
        session: SessionId,
        classes: EventClass,
        priority: i32,
        token: u64,
    ) -> Result<HandlerId> {
        self.with_state(|state| {
            if !state.sessions.contains_key(&session) {
                return Err(InputError::SessionGone);
            }
            let id = state.next_handler_id()?;
            let callback = self.acquire_callback(session, token);
            state.interceptors.push(InterceptorEntry { id, session, classes, priority, callback });
            info!(session, id, classes = classes.bits(), priority, "interceptor added");
            Ok(id)
        })
    }

    pub fn remove_interceptor(&self, session: SessionId, id: HandlerId) -> Result<()> {
        self.with_state(|state| {
            let idx = state
                .interceptors
                .iter()
                .position(|i| i.id == id && i.session == session)
                .ok_or(InputError::NotFound)?;
            let interceptor = state.interceptors.remove(idx);
            self.callbacks.release(interceptor.callback);
            info!(session, id, "interceptor removed");
            Ok(())
        })
    }

    /// Record that the session's monitor consumed one event. Repeated marks
    /// for the same pair succeed without effect.
    pub fn mark_consumed(&self, session: SessionId, monitor: HandlerId, event_id: EventId) -> Result<()> {
        self.with_state(|state| {
            let owned = state.monitors.iter().any(|m| m.id == monitor && m.session == session);
            if !owned {
                return Err(InputError::NotFound);
            }
            if state.ledger.mark(event_id, monitor)? {
                debug!(session, monitor, event_id, "event consumed");
            }
            Ok(())
        })?;
        self.signal_consumption();
        Ok(())
    }
}
