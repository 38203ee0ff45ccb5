//! Raw input listener
//!
//! Drains raw events produced by the driver, normalizes key transitions
//! through a `KeyStateTracker` and forwards numbered `InputEvent`s to the
//! distribution pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::driver::RawInput;
use crate::events::{EventId, InputEvent};

use super::tracker::KeyStateTracker;

/// Listener that turns raw driver input into pipeline events
pub struct InputListener {
    event_tx: mpsc::Sender<InputEvent>,
    running: Arc<AtomicBool>,
    next_event_id: Arc<AtomicU64>,
    stop_tx: watch::Sender<bool>,
}

impl InputListener {
    /// Create a new listener
    pub fn new(event_tx: mpsc::Sender<InputEvent>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
            next_event_id: Arc::new(AtomicU64::new(1)),
            stop_tx,
        }
    }

    /// Start the listener
    ///
    /// Spawns a task on the current runtime that waits on the raw input
    /// stream. The listener runs until `stop()` is called, the raw stream
    /// closes or the pipeline goes away.
    pub fn start(&self, raw_rx: mpsc::UnboundedReceiver<RawInput>) -> Result<(), ListenerError> {
        let runtime = Handle::try_current().map_err(|_| ListenerError::NoRuntime)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyRunning);
        }

        self.stop_tx.send_replace(false);
        let stop_rx = self.stop_tx.subscribe();
        let event_tx = self.event_tx.clone();
        let running = Arc::clone(&self.running);
        let next_event_id = Arc::clone(&self.next_event_id);

        runtime.spawn(async move {
            info!("input listener started");

            if let Err(e) = run_event_loop(raw_rx, event_tx, stop_rx, &next_event_id).await {
                error!(?e, "input listener error");
            }

            running.store(false, Ordering::SeqCst);
            info!("input listener stopped");
        });

        Ok(())
    }

    /// Stop the listener; a pending wait on the raw stream is woken
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Check if the listener is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Errors that can occur in the input listener
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("input listener is already running")]
    AlreadyRunning,

    #[error("input listener started outside a tokio runtime")]
    NoRuntime,

    #[error("pipeline channel closed")]
    ChannelClosed,
}

async fn run_event_loop(
    mut raw_rx: mpsc::UnboundedReceiver<RawInput>,
    event_tx: mpsc::Sender<InputEvent>,
    mut stop_rx: watch::Receiver<bool>,
    next_event_id: &AtomicU64,
) -> Result<(), ListenerError> {
    let mut tracker = KeyStateTracker::new();

    loop {
        let raw = tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(raw) => raw,
                None => {
                    debug!("raw input stream closed");
                    break;
                }
            },
            _ = stop_rx.changed() => break,
        };

        let id: EventId = next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = match raw {
            RawInput::Key { code, action, time } => {
                InputEvent::key(id, tracker.on_raw_key_event(code, action, time))
            }
            RawInput::Pointer(pointer) => InputEvent::pointer(id, pointer),
        };

        if event_tx.send(event).await.is_err() {
            warn!("failed to forward input event - pipeline closed?");
            return Err(ListenerError::ChannelClosed);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::driver::SoftwareDriver;
    use crate::events::{InputKind, KeyAction};
    use crate::hotkey::codes;

    async fn wait_stopped(listener: &InputListener) {
        for _ in 0..100 {
            if !listener.is_running() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("listener still running");
    }

    #[test]
    fn test_listener_creation() {
        let (tx, _rx) = mpsc::channel(32);
        let listener = InputListener::new(tx);
        assert!(!listener.is_running());
        // No runtime to spawn on
        let (_raw_tx, raw_rx) = mpsc::unbounded_channel();
        assert!(matches!(listener.start(raw_rx), Err(ListenerError::NoRuntime)));
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_listener_normalizes_and_numbers_events() {
        let (tx, mut rx) = mpsc::channel(32);
        let driver = SoftwareDriver::new();
        let listener = InputListener::new(tx);
        listener.start(driver.take_raw_input().unwrap()).unwrap();
        assert!(matches!(
            listener.start(mpsc::unbounded_channel().1),
            Err(ListenerError::AlreadyRunning)
        ));

        let raw_tx = driver.injector();
        raw_tx
            .send(RawInput::Key { code: codes::CTRL_LEFT, action: KeyAction::Down, time: 10 })
            .unwrap();
        raw_tx
            .send(RawInput::Key { code: codes::S, action: KeyAction::Down, time: 20 })
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.id > first.id);
        match second.kind {
            InputKind::Key(key) => {
                assert_eq!(key.key_code, codes::S);
                assert_eq!(key.pressed.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }

        listener.stop();
        wait_stopped(&listener).await;
    }

    #[tokio::test]
    async fn test_stop_wakes_idle_listener() {
        let (tx, mut rx) = mpsc::channel(32);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let listener = InputListener::new(tx);
        listener.start(raw_rx).unwrap();

        // Stops without any input arriving, and input after the stop is ignored
        listener.stop();
        timeout(Duration::from_secs(1), wait_stopped(&listener)).await.unwrap();
        let _ = raw_tx.send(RawInput::Key { code: codes::A, action: KeyAction::Down, time: 1 });
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        // A stopped listener can be started again
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        listener.start(raw_rx).unwrap();
        raw_tx.send(RawInput::Key { code: codes::A, action: KeyAction::Down, time: 2 }).unwrap();
        assert!(rx.recv().await.is_some());
        listener.stop();
        wait_stopped(&listener).await;
    }

    #[tokio::test]
    async fn test_closed_raw_stream_ends_listener() {
        let (tx, _rx) = mpsc::channel(32);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawInput>();
        let listener = InputListener::new(tx);
        listener.start(raw_rx).unwrap();
        drop(raw_tx);
        wait_stopped(&listener).await;
    }
}
