//! Input driver collaborator
//!
//! The registry asks the driver to grab a key combination when the first
//! subscriber for it arrives and to release it when the last one leaves.
//! `SoftwareDriver` keeps grabs in memory and accepts injected raw events;
//! a hardware adapter implements the same trait.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::InputError;
use crate::events::{KeyAction, PointerEvent};
use crate::hotkey::{KeyCode, KeyOption};

/// Handle for one combination grab held by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrabHandle(pub u64);

/// Reasons the driver refuses a grab
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("combination not supported by the device")]
    CapabilityNotSupported,

    #[error("combination is reserved by the system")]
    OccupiedBySystem,

    #[error("combination is grabbed by another owner")]
    OccupiedByOther,
}

impl From<DriverError> for InputError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::CapabilityNotSupported => InputError::CapabilityNotSupported,
            DriverError::OccupiedBySystem => InputError::OccupiedBySystem,
            DriverError::OccupiedByOther => InputError::OccupiedByOther,
        }
    }
}

/// Grab interface consumed by the registry. Implementations are called with
/// the registry lock held and must not block.
pub trait InputDriver: Send + Sync {
    fn grab_combination(&self, option: &KeyOption) -> Result<GrabHandle, DriverError>;

    fn release_combination(&self, handle: GrabHandle);
}

/// Raw input as produced by a device adapter, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Key {
        code: KeyCode,
        action: KeyAction,
        /// Microseconds
        time: i64,
    },
    Pointer(PointerEvent),
}

struct SoftwareState {
    next_handle: u64,
    grabs: HashMap<GrabHandle, String>,
    reserved: HashSet<String>,
    unsupported: HashSet<KeyCode>,
    total_grabs: u64,
}

/// In-memory driver with configurable reserved and unsupported combinations
pub struct SoftwareDriver {
    state: Mutex<SoftwareState>,
    raw_tx: mpsc::UnboundedSender<RawInput>,
    raw_rx: Mutex<Option<mpsc::UnboundedReceiver<RawInput>>>,
}

impl SoftwareDriver {
    pub fn new() -> Self {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(SoftwareState {
                next_handle: 1,
                grabs: HashMap::new(),
                reserved: HashSet::new(),
                unsupported: HashSet::new(),
                total_grabs: 0,
            }),
            raw_tx,
            raw_rx: Mutex::new(Some(raw_rx)),
        }
    }

    /// Mark a combination as owned by the system
    pub fn reserve(&self, option: &KeyOption) {
        self.state.lock().reserved.insert(option.canonical_key());
    }

    /// Mark a key as absent from the device
    pub fn mark_unsupported(&self, code: KeyCode) {
        self.state.lock().unsupported.insert(code);
    }

    /// Number of grabs currently held
    pub fn active_grabs(&self) -> usize {
        self.state.lock().grabs.len()
    }

    /// Number of grabs ever granted
    pub fn total_grabs(&self) -> u64 {
        self.state.lock().total_grabs
    }

    /// Sender for injecting raw input. Never blocks, so device callbacks
    /// can call it from any thread.
    pub fn injector(&self) -> mpsc::UnboundedSender<RawInput> {
        self.raw_tx.clone()
    }

    /// Take the raw input stream; only the first caller gets it
    pub fn take_raw_input(&self) -> Option<mpsc::UnboundedReceiver<RawInput>> {
        self.raw_rx.lock().take()
    }
}

impl Default for SoftwareDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InputDriver for SoftwareDriver {
    fn grab_combination(&self, option: &KeyOption) -> Result<GrabHandle, DriverError> {
        let mut state = self.state.lock();
        let key = option.canonical_key();

        let mut keys = option.pre_keys.iter().chain(std::iter::once(&option.final_key));
        if keys.any(|k| state.unsupported.contains(k)) {
            return Err(DriverError::CapabilityNotSupported);
        }
        if state.reserved.contains(&key) {
            return Err(DriverError::OccupiedBySystem);
        }
        if state.grabs.values().any(|held| *held == key) {
            return Err(DriverError::OccupiedByOther);
        }

        let handle = GrabHandle(state.next_handle);
        state.next_handle += 1;
        state.total_grabs += 1;
        debug!(handle = handle.0, key = %key, "combination grabbed");
        state.grabs.insert(handle, key);
        Ok(handle)
    }

    fn release_combination(&self, handle: GrabHandle) {
        if let Some(key) = self.state.lock().grabs.remove(&handle) {
            debug!(handle = handle.0, key = %key, "combination released");
        }
    }
}
