//! Distribution pipeline
//!
//! Routes each normalized event, in a fixed order:
//!
//! 1. interceptors registered for the event's class, exclusively;
//! 2. otherwise every monitor registered for the class;
//! 3. for key events, every subscription whose key option matches;
//! 4. the default target, unless a monitor consumed the event or a grabbed
//!    combination took it.
//!
//! Routing is planned under the registry lock and the resulting deliveries
//! are handed off after the lock is released. An event copied to monitors is
//! held back from the default target until it settles: a mark drops it, and
//! it is forwarded once no recipient can mark it any more or the
//! consumption timeout passes.

mod route;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::events::{EventId, InputEvent, LiveKeyEvent, PointerEvent};
use crate::registry::{HandlerId, Registry, Settlement, SubscriptionId};

/// How long a monitored event waits for a consumption mark
pub const DEFAULT_CONSUMPTION_TIMEOUT: Duration = Duration::from_millis(50);

use route::Route;

/// One event addressed to one registered entry
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Key event matching a key subscription, hotkey or key monitor
    Key {
        subscription: SubscriptionId,
        event_id: EventId,
        event: LiveKeyEvent,
    },

    /// Key event seen by a monitor or interceptor
    HandlerKey {
        handler: HandlerId,
        event_id: EventId,
        event: LiveKeyEvent,
    },

    /// Pointer event seen by a monitor or interceptor
    Pointer {
        handler: HandlerId,
        event_id: EventId,
        event: PointerEvent,
    },
}

impl Delivery {
    pub fn event_id(&self) -> EventId {
        match self {
            Delivery::Key { event_id, .. }
            | Delivery::HandlerKey { event_id, .. }
            | Delivery::Pointer { event_id, .. } => *event_id,
        }
    }
}

/// Receiver of events nobody intercepted, grabbed or consumed
pub trait DefaultTarget: Send + Sync {
    fn deliver(&self, event: &InputEvent);
}

/// Default target that only logs
#[derive(Debug, Default)]
pub struct LogTarget;

impl DefaultTarget for LogTarget {
    fn deliver(&self, event: &InputEvent) {
        trace!(event_id = event.id, "event forwarded to default target");
    }
}

/// What happened to one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub event_id: EventId,
    /// Interceptors took the event exclusively
    pub intercepted: bool,
    /// A grabbed key combination matched
    pub grabbed: bool,
    /// Monitors that received a copy and may mark it consumed
    pub monitored: usize,
    /// Deliveries handed off
    pub delivered: usize,
    /// Deliveries dropped because their session was gone
    pub dropped: usize,
    /// Largest outbox backlog among the sessions delivered to
    pub backlog: usize,
}

/// What becomes of an event at the default target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    /// Interceptors or a grabbed combination took it
    Withheld,
    /// Nobody can consume it
    Immediate,
    /// Held until its monitors settle it
    AwaitConsumption,
}

impl DispatchOutcome {
    pub fn forwarding(&self) -> Forwarding {
        if self.intercepted || self.grabbed {
            Forwarding::Withheld
        } else if self.monitored > 0 {
            Forwarding::AwaitConsumption
        } else {
            Forwarding::Immediate
        }
    }
}

struct HeldEvent {
    event: InputEvent,
    deadline: Instant,
}

pub struct Pipeline {
    registry: Arc<Registry>,
    target: Arc<dyn DefaultTarget>,
    consumption_timeout: Duration,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, target: Arc<dyn DefaultTarget>) -> Self {
        Self { registry, target, consumption_timeout: DEFAULT_CONSUMPTION_TIMEOUT }
    }

    pub fn with_consumption_timeout(mut self, timeout: Duration) -> Self {
        self.consumption_timeout = timeout;
        self
    }

    /// Route one event to every interested entry
    pub fn dispatch(&self, event: &InputEvent) -> DispatchOutcome {
        let route = self.registry.with_state(|state| Route::plan(state, event));

        let mut outcome = DispatchOutcome {
            event_id: event.id,
            intercepted: route.intercepted,
            grabbed: route.grabbed,
            monitored: route.monitored,
            ..DispatchOutcome::default()
        };

        for (outbox, callback, delivery) in route.deliveries {
            match outbox.enqueue(callback, delivery) {
                Ok(()) => {
                    outcome.delivered += 1;
                    outcome.backlog = outcome.backlog.max(outbox.pending());
                }
                Err(_) => outcome.dropped += 1,
            }
        }

        if outcome.dropped > 0 {
            debug!(event_id = event.id, dropped = outcome.dropped, "deliveries to closed sessions dropped");
        }
        outcome
    }

    /// Dispatch events until the ingestion channel closes, forwarding to the
    /// default target whatever nobody withheld or consumed
    pub async fn run(&self, mut event_rx: mpsc::Receiver<InputEvent>) {
        info!(timeout = ?self.consumption_timeout, "distribution pipeline started");
        let mut held: VecDeque<HeldEvent> = VecDeque::new();
        let mut consumption = self.registry.watch_consumption();

        loop {
            let deadline = held.front().map(|h| h.deadline);
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let outcome = self.dispatch(&event);
                    trace!(?outcome, "event dispatched");
                    match outcome.forwarding() {
                        Forwarding::Immediate => self.target.deliver(&event),
                        Forwarding::AwaitConsumption => held.push_back(HeldEvent {
                            event,
                            deadline: Instant::now() + self.consumption_timeout,
                        }),
                        Forwarding::Withheld => {}
                    }
                }
                _ = consumption.changed() => {}
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
            self.settle(&mut held, Instant::now());
        }

        // No mark can arrive in time any more
        for h in held {
            if self.registry.settle(h.event.id) != Settlement::Consumed {
                self.target.deliver(&h.event);
            }
        }
        info!("distribution pipeline stopped");
    }

    /// Drop consumed events and forward the ones nobody can still consume,
    /// keeping dispatch order
    fn settle(&self, held: &mut VecDeque<HeldEvent>, now: Instant) {
        // An event still pending blocks forwarding of everything behind it
        let mut blocked = false;
        held.retain(|h| match self.registry.settle(h.event.id) {
            Settlement::Consumed => {
                debug!(event_id = h.event.id, "event consumed by monitor");
                false
            }
            Settlement::Pending if h.deadline > now => {
                blocked = true;
                true
            }
            _ if blocked => true,
            Settlement::Pending | Settlement::Unclaimed => {
                self.target.deliver(&h.event);
                false
            }
        });
    }
}
