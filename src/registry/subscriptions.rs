//! Key subscriptions, system hotkeys and key monitors
//!
//! Subscriptions are grouped by canonical key option. The first subscriber
//! of a group grabs the combination from the driver and the last one to
//! leave releases it, so each canonical option is grabbed at most once.

use tracing::{debug, info, warn};

use crate::error::{InputError, Result};
use crate::events::{KeyAction, SessionId};
use crate::hotkey::{KeyCode, KeyOption};

use super::{KeyGroup, Registry, Subscription, SubscriptionId, SubscriptionKind};

impl Registry {
    /// Subscribe to a key or chord. Re-subscribing the same option with the
    /// same callback returns the existing id.
    pub fn subscribe_key_event(
        &self,
        session: SessionId,
        option: KeyOption,
        token: u64,
    ) -> Result<SubscriptionId> {
        option.validate()?;
        self.subscribe_grabbed(session, SubscriptionKind::Key, option, token)
    }

    pub fn unsubscribe_key_event(&self, session: SessionId, id: SubscriptionId) -> Result<()> {
        self.unsubscribe_grabbed(session, SubscriptionKind::Key, id)
    }

    /// Subscribe to a system hotkey. A hotkey is exclusive to one session.
    pub fn subscribe_hotkey(
        &self,
        session: SessionId,
        option: KeyOption,
        token: u64,
    ) -> Result<SubscriptionId> {
        option.validate_hotkey()?;
        self.subscribe_grabbed(session, SubscriptionKind::Hotkey, option, token)
    }

    pub fn unsubscribe_hotkey(&self, session: SessionId, id: SubscriptionId) -> Result<()> {
        self.unsubscribe_grabbed(session, SubscriptionKind::Hotkey, id)
    }

    /// Observe one allow-listed key without grabbing it
    pub fn subscribe_key_monitor(
        &self,
        session: SessionId,
        key: KeyCode,
        action: KeyAction,
        token: u64,
    ) -> Result<SubscriptionId> {
        let option = KeyOption::single(key, action)?;
        option.validate_key_monitor()?;
        let canonical = option.canonical_key();

        self.with_state(|state| {
            if !state.sessions.contains_key(&session) {
                return Err(InputError::SessionGone);
            }

            let existing = state.key_monitors.iter().find(|sub| {
                sub.session == session && sub.token == token && sub.option.canonical_key() == canonical
            });
            if let Some(sub) = existing {
                return Ok(sub.id);
            }

            let id = state.next_subscription_id()?;
            let callback = self.acquire_callback(session, token);
            state.key_monitors.push(Subscription {
                id,
                session,
                kind: SubscriptionKind::KeyMonitor,
                option,
                token,
                callback,
            });
            info!(session, id, key, ?action, "key monitor added");
            Ok(id)
        })
    }

    pub fn unsubscribe_key_monitor(&self, session: SessionId, id: SubscriptionId) -> Result<()> {
        self.with_state(|state| {
            let idx = state
                .key_monitors
                .iter()
                .position(|sub| sub.id == id && sub.session == session)
                .ok_or(InputError::NotFound)?;
            let sub = state.key_monitors.remove(idx);
            self.callbacks.release(sub.callback);
            info!(session, id, "key monitor removed");
            Ok(())
        })
    }

    fn subscribe_grabbed(
        &self,
        session: SessionId,
        kind: SubscriptionKind,
        option: KeyOption,
        token: u64,
    ) -> Result<SubscriptionId> {
        let canonical = option.canonical_key();

        self.with_state(|state| {
            if !state.sessions.contains_key(&session) {
                return Err(InputError::SessionGone);
            }

            let id = if let Some(group) = state.groups.get(&canonical) {
                let duplicate = group
                    .subscribers
                    .iter()
                    .find(|sub| sub.session == session && sub.kind == kind && sub.token == token);
                if let Some(sub) = duplicate {
                    debug!(session, id = sub.id, key = %canonical, "duplicate subscription");
                    return Ok(sub.id);
                }

                let held_elsewhere = group
                    .subscribers
                    .iter()
                    .any(|sub| sub.kind == SubscriptionKind::Hotkey && sub.session != session);
                if kind == SubscriptionKind::Hotkey && held_elsewhere {
                    return Err(InputError::OccupiedByOther);
                }
                state.next_subscription_id()?
            } else {
                // Nothing is recorded until the driver grants the grab
                let id = state.next_subscription_id()?;
                let grab = self.driver.grab_combination(&option).map_err(|e| {
                    warn!(session, key = %canonical, error = %e, "combination grab refused");
                    InputError::from(e)
                })?;
                state.groups.insert(
                    canonical.clone(),
                    KeyGroup { option: option.clone(), grab, subscribers: Vec::new() },
                );
                id
            };

            let callback = self.acquire_callback(session, token);
            if let Some(group) = state.groups.get_mut(&canonical) {
                group.subscribers.push(Subscription { id, session, kind, option, token, callback });
            }
            info!(session, id, ?kind, key = %canonical, "subscribed");
            Ok(id)
        })
    }

    fn unsubscribe_grabbed(
        &self,
        session: SessionId,
        kind: SubscriptionKind,
        id: SubscriptionId,
    ) -> Result<()> {
        self.with_state(|state| {
            let found = state.groups.iter().find_map(|(key, group)| {
                group
                    .subscribers
                    .iter()
                    .position(|sub| sub.id == id && sub.session == session && sub.kind == kind)
                    .map(|idx| (key.clone(), idx))
            });
            let (canonical, idx) = found.ok_or(InputError::NotFound)?;

            let emptied = match state.groups.get_mut(&canonical) {
                Some(group) => {
                    let sub = group.subscribers.remove(idx);
                    self.callbacks.release(sub.callback);
                    group.subscribers.is_empty()
                }
                None => false,
            };

            if emptied {
                if let Some(group) = state.groups.remove(&canonical) {
                    self.driver.release_combination(group.grab);
                }
            }
            info!(session, id, ?kind, key = %canonical, "unsubscribed");
            Ok(())
        })
    }
}
