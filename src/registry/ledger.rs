//! Consumption marks for recently dispatched events
//!
//! Marks live here rather than on monitor entries: each one is scoped to a
//! single event and ages out with it.

use std::collections::{HashMap, VecDeque};

use crate::error::{InputError, Result};
use crate::events::EventId;

use super::HandlerId;

/// Where a monitored event stands with respect to consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// At least one monitor consumed the event
    Consumed,
    /// A recipient that could still mark the event is registered
    Pending,
    /// Nobody can mark the event any more: it aged out of the window or all
    /// of its recipients are gone
    Unclaimed,
}

#[derive(Debug, Default)]
struct LedgerEntry {
    /// Monitors the event was delivered to
    recipients: Vec<HandlerId>,
    consumed_by: Vec<HandlerId>,
}

/// Bounded record of which monitors saw and consumed recent events
#[derive(Debug)]
pub struct ConsumptionLedger {
    window: usize,
    order: VecDeque<EventId>,
    events: HashMap<EventId, LedgerEntry>,
}

impl ConsumptionLedger {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            order: VecDeque::new(),
            events: HashMap::new(),
        }
    }

    /// Remember that `event_id` went to `recipients`, evicting the oldest
    /// event once the window is full
    pub fn record(&mut self, event_id: EventId, recipients: Vec<HandlerId>) {
        if recipients.is_empty() {
            return;
        }
        if self.events.len() >= self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.events.remove(&oldest);
            }
        }
        self.order.push_back(event_id);
        self.events.insert(event_id, LedgerEntry { recipients, consumed_by: Vec::new() });
    }

    /// Mark the event consumed by `monitor`. Returns false when the mark was
    /// already present.
    pub fn mark(&mut self, event_id: EventId, monitor: HandlerId) -> Result<bool> {
        let entry = self
            .events
            .get_mut(&event_id)
            .ok_or(InputError::InvalidParameter("event not tracked"))?;
        if !entry.recipients.contains(&monitor) {
            return Err(InputError::InvalidParameter("event not delivered to monitor"));
        }
        if entry.consumed_by.contains(&monitor) {
            return Ok(false);
        }
        entry.consumed_by.push(monitor);
        Ok(true)
    }

    /// Settle the event given which monitors are still registered
    pub fn settle(&self, event_id: EventId, registered: impl Fn(HandlerId) -> bool) -> Settlement {
        match self.events.get(&event_id) {
            None => Settlement::Unclaimed,
            Some(entry) if !entry.consumed_by.is_empty() => Settlement::Consumed,
            Some(entry) if entry.recipients.iter().any(|&m| registered(m)) => Settlement::Pending,
            Some(_) => Settlement::Unclaimed,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_is_idempotent_and_per_event() {
        let mut ledger = ConsumptionLedger::new(8);
        ledger.record(1, vec![10, 11]);
        ledger.record(2, vec![10, 11]);

        assert_eq!(ledger.mark(1, 10), Ok(true));
        assert_eq!(ledger.mark(1, 10), Ok(false));
        assert_eq!(ledger.settle(1, |_| true), Settlement::Consumed);
        assert_eq!(ledger.settle(2, |_| true), Settlement::Pending);
    }

    #[test]
    fn test_settle_without_reachable_recipients() {
        let mut ledger = ConsumptionLedger::new(2);
        ledger.record(1, vec![10, 11]);
        ledger.record(2, vec![10]);

        // Monitor 10 is gone, 11 may still mark event 1
        assert_eq!(ledger.settle(1, |m| m == 11), Settlement::Pending);
        assert_eq!(ledger.settle(2, |m| m == 11), Settlement::Unclaimed);

        // Aged out of the window
        ledger.record(3, vec![10]);
        assert_eq!(ledger.settle(1, |_| true), Settlement::Unclaimed);
        // Never monitored
        assert_eq!(ledger.settle(42, |_| true), Settlement::Unclaimed);
    }

    #[test]
    fn test_mark_requires_delivery() {
        let mut ledger = ConsumptionLedger::new(8);
        ledger.record(1, vec![10]);
        assert!(ledger.mark(1, 12).is_err());
        assert!(ledger.mark(99, 10).is_err());
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut ledger = ConsumptionLedger::new(2);
        ledger.record(1, vec![1]);
        ledger.record(2, vec![1]);
        ledger.record(3, vec![1]);
        assert_eq!(ledger.len(), 2);
        assert!(ledger.mark(1, 1).is_err());
        assert!(ledger.mark(3, 1).is_ok());
    }
}
