//! Process-wide subscription registry
//!
//! Owns every key subscription, key monitor, event monitor and interceptor,
//! indexed for the distribution pipeline. All mutation and every pipeline
//! sweep run under the single registry lock; callbacks are never invoked
//! with it held.

mod ledger;
mod monitors;
mod subscriptions;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::driver::{GrabHandle, InputDriver};
use crate::error::{InputError, Result};
use crate::events::{EventClass, EventId, SessionId};
use crate::handoff::{CallbackArena, CallbackHandle, HandoffSender};
use crate::hotkey::KeyOption;
use crate::pipeline::Delivery;

pub use ledger::{ConsumptionLedger, Settlement};

/// Identifier of a key subscription or key monitor
pub type SubscriptionId = i32;

/// Identifier of an event monitor or interceptor
pub type HandlerId = i32;

/// Callback identity of a remote client: its session and its own token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteCallback {
    pub session: SessionId,
    pub token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Key,
    Hotkey,
    KeyMonitor,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub session: SessionId,
    pub kind: SubscriptionKind,
    pub option: KeyOption,
    pub token: u64,
    pub callback: CallbackHandle,
}

/// Subscribers sharing one canonical key option and its grab
#[derive(Debug)]
pub(crate) struct KeyGroup {
    pub option: KeyOption,
    pub grab: GrabHandle,
    /// In registration order
    pub subscribers: Vec<Subscription>,
}

#[derive(Debug, Clone)]
pub struct MonitorEntry {
    pub id: HandlerId,
    pub session: SessionId,
    pub classes: EventClass,
    pub callback: CallbackHandle,
}

#[derive(Debug, Clone)]
pub struct InterceptorEntry {
    pub id: HandlerId,
    pub session: SessionId,
    pub classes: EventClass,
    pub priority: i32,
    pub callback: CallbackHandle,
}

pub(crate) struct SessionEntry {
    pub pid: Option<i32>,
    pub outbox: HandoffSender<Delivery>,
}

/// Everything guarded by the registry lock
pub(crate) struct RegistryState {
    pub sessions: HashMap<SessionId, SessionEntry>,
    pub groups: BTreeMap<String, KeyGroup>,
    pub key_monitors: Vec<Subscription>,
    pub monitors: Vec<MonitorEntry>,
    pub interceptors: Vec<InterceptorEntry>,
    pub ledger: ConsumptionLedger,
    next_session: SessionId,
    next_subscription: SubscriptionId,
    next_handler: HandlerId,
}

/// Hand out `*next` and advance it. The type's maximum is never handed out,
/// so ids cannot wrap into negatives that read as error codes on the wire.
fn allocate<T: Copy + CheckedIncrement>(next: &mut T) -> Result<T> {
    let id = *next;
    *next = id.checked_increment().ok_or(InputError::InvalidParameter("identifier space exhausted"))?;
    Ok(id)
}

trait CheckedIncrement: Sized {
    fn checked_increment(self) -> Option<Self>;
}

impl CheckedIncrement for i32 {
    fn checked_increment(self) -> Option<Self> {
        self.checked_add(1)
    }
}

impl CheckedIncrement for u64 {
    fn checked_increment(self) -> Option<Self> {
        self.checked_add(1)
    }
}

impl RegistryState {
    fn next_subscription_id(&mut self) -> Result<SubscriptionId> {
        allocate(&mut self.next_subscription)
    }

    fn next_handler_id(&mut self) -> Result<HandlerId> {
        allocate(&mut self.next_handler)
    }
}

/// Counts of registry entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub combinations: usize,
    pub subscriptions: usize,
    pub key_monitors: usize,
    pub monitors: usize,
    pub interceptors: usize,
    /// Monitored events still open to consumption marks
    pub tracked_events: usize,
}

/// The subscription registry, shared by handle between the dispatcher and
/// the pipeline
pub struct Registry {
    state: Mutex<RegistryState>,
    driver: Arc<dyn InputDriver>,
    callbacks: Arc<CallbackArena<RemoteCallback>>,
    /// Bumped whenever a mark or a monitor removal may settle a held event
    consumption: watch::Sender<u64>,
}

impl Registry {
    pub fn new(driver: Arc<dyn InputDriver>, consumption_window: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                groups: BTreeMap::new(),
                key_monitors: Vec::new(),
                monitors: Vec::new(),
                interceptors: Vec::new(),
                ledger: ConsumptionLedger::new(consumption_window),
                next_session: 1,
                next_subscription: 1,
                next_handler: 1,
            }),
            driver,
            callbacks: Arc::new(CallbackArena::new()),
            consumption: watch::channel(0).0,
        }
    }

    /// Arena holding the callback identities of every registered entry;
    /// session outboxes check liveness against it
    pub fn callbacks(&self) -> Arc<CallbackArena<RemoteCallback>> {
        Arc::clone(&self.callbacks)
    }

    /// Register a connected client and the queue its deliveries go to
    pub fn open_session(&self, pid: Option<i32>, outbox: HandoffSender<Delivery>) -> Result<SessionId> {
        let mut state = self.state.lock();
        let id = allocate(&mut state.next_session)?;
        state.sessions.insert(id, SessionEntry { pid, outbox });
        info!(session = id, ?pid, "session opened");
        Ok(id)
    }

    /// Release everything the session owns in one locked pass. Returns the
    /// number of entries released.
    pub fn close_session(&self, session: SessionId) -> usize {
        let mut state = self.state.lock();
        let Some(entry) = state.sessions.remove(&session) else {
            return 0;
        };

        let mut released = 0;
        let mut emptied = Vec::new();
        for (key, group) in state.groups.iter_mut() {
            group.subscribers.retain(|sub| {
                if sub.session != session {
                    return true;
                }
                self.callbacks.release(sub.callback);
                released += 1;
                false
            });
            if group.subscribers.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            if let Some(group) = state.groups.remove(&key) {
                self.driver.release_combination(group.grab);
            }
        }

        let callbacks = &self.callbacks;
        let mut release = |owner: SessionId, handle: CallbackHandle| {
            if owner != session {
                return true;
            }
            callbacks.release(handle);
            released += 1;
            false
        };
        state.key_monitors.retain(|sub| release(sub.session, sub.callback));
        state.monitors.retain(|m| release(m.session, m.callback));
        state.interceptors.retain(|i| release(i.session, i.callback));

        drop(state);
        self.signal_consumption();

        info!(session, pid = ?entry.pid, released, "session closed");
        released
    }

    /// Whether a monitored event was consumed, may still be, or can no
    /// longer be
    pub fn settle(&self, event_id: EventId) -> Settlement {
        let state = self.state.lock();
        state
            .ledger
            .settle(event_id, |id| state.monitors.iter().any(|m| m.id == id))
    }

    /// Changes whenever a consumption mark or a monitor removal may have
    /// settled an event
    pub fn watch_consumption(&self) -> watch::Receiver<u64> {
        self.consumption.subscribe()
    }

    fn signal_consumption(&self) {
        self.consumption.send_modify(|seq| *seq = seq.wrapping_add(1));
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            sessions: state.sessions.len(),
            combinations: state.groups.len(),
            subscriptions: state.groups.values().map(|g| g.subscribers.len()).sum(),
            key_monitors: state.key_monitors.len(),
            monitors: state.monitors.len(),
            interceptors: state.interceptors.len(),
            tracked_events: state.ledger.len(),
        }
    }

    /// Run `f` with the registry lock held
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    fn acquire_callback(&self, session: SessionId, token: u64) -> CallbackHandle {
        let handle = self.callbacks.acquire(RemoteCallback { session, token });
        debug!(session, token, handle = handle.to_raw(), "callback referenced");
        handle
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::driver::SoftwareDriver;
    use crate::handoff::{self, HandoffReceiver};

    pub type Outbox = HandoffReceiver<RemoteCallback, Delivery>;

    pub fn registry() -> (Arc<Registry>, Arc<SoftwareDriver>) {
        let driver = Arc::new(SoftwareDriver::new());
        let registry = Arc::new(Registry::new(driver.clone(), 16));
        (registry, driver)
    }

    pub fn session(registry: &Registry) -> (SessionId, Outbox) {
        let (tx, rx) = handoff::channel(registry.callbacks());
        (registry.open_session(None, tx).unwrap(), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{registry, session};
    use super::*;
    use crate::events::KeyAction;
    use crate::hotkey::codes;

    #[test]
    fn test_close_session_releases_everything() {
        let (registry, driver) = registry();
        let (a, _rx_a) = session(&registry);
        let (b, _rx_b) = session(&registry);

        let shared = KeyOption::chord(&[codes::CTRL_LEFT], codes::S);
        registry.subscribe_key_event(a, shared.clone(), 1).unwrap();
        registry.subscribe_key_event(a, KeyOption::chord(&[codes::ALT_LEFT], codes::C), 2).unwrap();
        registry.subscribe_key_event(b, shared.clone(), 9).unwrap();
        registry.subscribe_key_monitor(a, codes::VOLUME_UP, KeyAction::Down, 3).unwrap();
        registry.add_monitor(a, EventClass::TOUCH, 4).unwrap();
        registry.add_monitor(a, EventClass::KEY, 5).unwrap();
        registry.add_interceptor(a, EventClass::MOUSE, 0, 6).unwrap();
        assert_eq!(driver.active_grabs(), 2);

        assert_eq!(registry.close_session(a), 6);
        assert_eq!(registry.close_session(a), 0);

        let stats = registry.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.combinations, 1);
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.key_monitors + stats.monitors + stats.interceptors, 0);
        // Only session b's callback is still referenced
        assert_eq!(registry.callbacks().len(), 1);
        assert_eq!(driver.active_grabs(), 1);
    }

    #[test]
    fn test_reregister_after_teardown() {
        let (registry, driver) = registry();
        let (a, _rx_a) = session(&registry);
        let option = KeyOption::chord(&[codes::CTRL_LEFT, codes::SHIFT_LEFT], codes::S);
        for token in 0..3 {
            registry.subscribe_key_event(a, option.clone(), token).unwrap();
        }
        registry.subscribe_hotkey(a, KeyOption::chord(&[codes::META_LEFT], codes::D), 7).unwrap();
        registry.add_monitor(a, EventClass::ALL, 8).unwrap();
        registry.close_session(a);
        assert_eq!(registry.stats(), RegistryStats::default());
        assert_eq!(driver.active_grabs(), 0);

        // A fresh session gets a fresh grab for the identical option
        let (b, _rx_b) = session(&registry);
        let id = registry.subscribe_hotkey(b, KeyOption::chord(&[codes::META_LEFT], codes::D), 7);
        assert!(id.is_ok());
        assert!(registry.subscribe_key_event(b, option, 0).is_ok());
        assert_eq!(driver.active_grabs(), 2);
        assert_eq!(registry.stats().subscriptions, 2);
    }

    #[test]
    fn test_ids_never_wrap() {
        let (registry, _driver) = registry();
        let (a, _rx) = session(&registry);
        registry.with_state(|state| {
            state.next_handler = i32::MAX - 1;
            state.next_subscription = i32::MAX - 1;
            state.next_session = u64::MAX - 1;
        });

        // The last id is still handed out, the one after it is refused
        assert_eq!(registry.add_monitor(a, EventClass::TOUCH, 1), Ok(i32::MAX - 1));
        assert!(matches!(
            registry.add_monitor(a, EventClass::TOUCH, 1),
            Err(InputError::InvalidParameter(_))
        ));
        assert_eq!(registry.subscribe_key_monitor(a, codes::VOLUME_UP, KeyAction::Down, 2), Ok(i32::MAX - 1));
        assert!(registry.subscribe_key_event(a, KeyOption::chord(&[codes::CTRL_LEFT], codes::S), 3).is_err());
        // The refused subscription left no grab or entry behind
        assert_eq!(registry.stats().combinations, 0);

        let (tx, _rx) = crate::handoff::channel(registry.callbacks());
        assert_eq!(registry.open_session(None, tx.clone()), Ok(u64::MAX - 1));
        assert!(registry.open_session(None, tx).is_err());
    }
}
