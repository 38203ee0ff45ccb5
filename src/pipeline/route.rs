//! Routing plan for one event, computed under the registry lock

use crate::events::{InputEvent, InputKind, LiveKeyEvent, SessionId};
use crate::handoff::{CallbackHandle, HandoffSender};
use crate::hotkey::matches;
use crate::registry::{HandlerId, RegistryState, Subscription, SubscriptionKind};

use super::Delivery;

pub(crate) struct Route {
    pub intercepted: bool,
    pub grabbed: bool,
    /// Monitors the event was copied to
    pub monitored: usize,
    pub deliveries: Vec<(HandoffSender<Delivery>, CallbackHandle, Delivery)>,
}

impl Route {
    pub fn plan(state: &mut RegistryState, event: &InputEvent) -> Route {
        let mut route = Route { intercepted: false, grabbed: false, monitored: 0, deliveries: Vec::new() };
        let class = event.class();

        let mut interceptors: Vec<_> = state
            .interceptors
            .iter()
            .filter(|i| i.classes.intersects(class))
            .collect();
        if !interceptors.is_empty() {
            // Stable sort keeps registration order among equal priorities
            interceptors.sort_by(|a, b| b.priority.cmp(&a.priority));
            for interceptor in interceptors {
                route.push_handler(state, interceptor.session, interceptor.callback, interceptor.id, event);
            }
            route.intercepted = true;
            return route;
        }

        let mut recipients = Vec::new();
        for monitor in state.monitors.iter().filter(|m| m.classes.intersects(class)) {
            route.push_handler(state, monitor.session, monitor.callback, monitor.id, event);
            recipients.push(monitor.id);
        }
        route.monitored = recipients.len();
        state.ledger.record(event.id, recipients);

        if let InputKind::Key(live) = &event.kind {
            route.plan_key(state, event, live);
        }
        route
    }

    fn plan_key(&mut self, state: &RegistryState, event: &InputEvent, live: &LiveKeyEvent) {
        let mut matched: Vec<&Subscription> = Vec::new();
        for group in state.groups.values() {
            if matches(&group.option, live) {
                matched.extend(group.subscribers.iter());
            }
        }
        matched.extend(state.key_monitors.iter().filter(|sub| matches(&sub.option, live)));

        // Ids are handed out in registration order
        matched.sort_by_key(|sub| sub.id);

        for sub in matched {
            if sub.kind != SubscriptionKind::KeyMonitor {
                self.grabbed = true;
            }
            let delivery = Delivery::Key {
                subscription: sub.id,
                event_id: event.id,
                event: live.clone(),
            };
            self.push(state, sub.session, sub.callback, delivery);
        }
    }

    fn push_handler(
        &mut self,
        state: &RegistryState,
        session: SessionId,
        callback: CallbackHandle,
        handler: HandlerId,
        event: &InputEvent,
    ) {
        let delivery = match &event.kind {
            InputKind::Key(live) => Delivery::HandlerKey {
                handler,
                event_id: event.id,
                event: live.clone(),
            },
            InputKind::Pointer(pointer) => Delivery::Pointer {
                handler,
                event_id: event.id,
                event: pointer.clone(),
            },
        };
        self.push(state, session, callback, delivery);
    }

    fn push(&mut self, state: &RegistryState, session: SessionId, callback: CallbackHandle, delivery: Delivery) {
        if let Some(entry) = state.sessions.get(&session) {
            self.deliveries.push((entry.outbox.clone(), callback, delivery));
        }
    }
}

