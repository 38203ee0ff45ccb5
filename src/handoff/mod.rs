//! Callback handoff
//!
//! Moves matched events from the thread that produced them to the context
//! that owns the callbacks. Tasks are owned values sent through an unbounded
//! channel, so producers never block. A task whose callback was unregistered
//! before the owner drained it is dropped without being invoked.

mod arena;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{InputError, Result};

pub use arena::{CallbackArena, CallbackHandle};

/// One pending invocation of a callback
#[derive(Debug)]
pub struct Task<E> {
    pub handle: CallbackHandle,
    pub event: E,
}

/// Create a handoff queue whose liveness checks go through `arena`
pub fn channel<C, E>(arena: Arc<CallbackArena<C>>) -> (HandoffSender<E>, HandoffReceiver<C, E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        HandoffSender { tx, pending: Arc::clone(&pending) },
        HandoffReceiver { rx, arena, pending },
    )
}

/// Producer side of a handoff queue
pub struct HandoffSender<E> {
    tx: mpsc::UnboundedSender<Task<E>>,
    pending: Arc<AtomicUsize>,
}

impl<E> Clone for HandoffSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<E> HandoffSender<E> {
    /// Queue `event` for the callback behind `handle`
    pub fn enqueue(&self, handle: CallbackHandle, event: E) -> Result<()> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Task { handle, event }).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(InputError::SessionGone);
        }
        Ok(())
    }

    /// Tasks queued but not yet taken by the owner
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Owner side of a handoff queue
pub struct HandoffReceiver<C, E> {
    rx: mpsc::UnboundedReceiver<Task<E>>,
    arena: Arc<CallbackArena<C>>,
    pending: Arc<AtomicUsize>,
}

impl<C: Clone, E> HandoffReceiver<C, E> {
    /// Wait for the next task whose callback is still registered. Returns
    /// `None` once every sender is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<(C, Task<E>)> {
        loop {
            let task = self.rx.recv().await?;
            if let Some(live) = self.admit(task) {
                return Some(live);
            }
        }
    }

    /// Next live task without waiting
    pub fn try_recv(&mut self) -> Option<(C, Task<E>)> {
        while let Ok(task) = self.rx.try_recv() {
            if let Some(live) = self.admit(task) {
                return Some(live);
            }
        }
        None
    }

    /// Invoke `f` once for every live task currently queued, in queue order.
    /// Returns the number of invocations.
    pub fn drain(&mut self, mut f: impl FnMut(&C, E)) -> usize {
        let mut invoked = 0;
        while let Some((callback, task)) = self.try_recv() {
            f(&callback, task.event);
            invoked += 1;
        }
        invoked
    }

    fn admit(&self, task: Task<E>) -> Option<(C, Task<E>)> {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        match self.arena.get(task.handle) {
            Some(callback) => Some((callback, task)),
            None => {
                trace!(handle = task.handle.to_raw(), "dropping task for unregistered callback");
                None
            }
        }
    }
}
