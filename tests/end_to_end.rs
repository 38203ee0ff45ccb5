use std::sync::Arc;
use std::time::Duration;

use inputd::client::{CallbackQueue, ClientCallback, ClientError, InputClient};
use inputd::driver::SoftwareDriver;
use inputd::error::InputError;
use inputd::events::{
    EventClass, EventId, InputEvent, KeyAction, KeyItem, LiveKeyEvent, PointerAction, PointerEvent,
    PointerSource,
};
use inputd::hotkey::{codes, KeyOption};
use inputd::ipc::{Server, ServerLimits};
use inputd::pipeline::{DefaultTarget, Delivery, Forwarding, LogTarget, Pipeline};
use inputd::registry::{Registry, Settlement};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

struct Harness {
    _dir: TempDir,
    server: Arc<Server>,
    registry: Arc<Registry>,
    driver: Arc<SoftwareDriver>,
    pipeline: Pipeline,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(SoftwareDriver::new());
        let registry = Arc::new(Registry::new(driver.clone(), 64));
        let server = Arc::new(
            Server::new(&dir.path().join("inputd.sock"), Arc::clone(&registry), ServerLimits::default()).unwrap(),
        );
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        let pipeline = Pipeline::new(Arc::clone(&registry), Arc::new(LogTarget));
        Self { _dir: dir, server, registry, driver, pipeline }
    }

    async fn wait_until(&self, mut condition: impl FnMut(&Self) -> bool) {
        for _ in 0..200 {
            if condition(self) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}

fn recorder() -> (ClientCallback, Arc<Mutex<Vec<(i32, EventId)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = ClientCallback::new(move |delivery| {
        let entry = match delivery {
            Delivery::Key { subscription, event_id, .. } => (*subscription, *event_id),
            Delivery::HandlerKey { handler, event_id, .. } | Delivery::Pointer { handler, event_id, .. } => {
                (*handler, *event_id)
            }
        };
        sink.lock().push(entry);
    });
    (callback, seen)
}

#[derive(Default)]
struct RecordingTarget {
    forwarded: Mutex<Vec<EventId>>,
}

impl DefaultTarget for RecordingTarget {
    fn deliver(&self, event: &InputEvent) {
        self.forwarded.lock().push(event.id);
    }
}

/// Let anything still in flight reach the client, then count what arrived
async fn settle_queue(client: &InputClient, queue: &mut CallbackQueue) -> usize {
    client.ping().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    queue.drain()
}

fn ctrl_s(id: EventId) -> InputEvent {
    InputEvent::key(
        id,
        LiveKeyEvent {
            key_code: codes::S,
            pressed: vec![
                KeyItem { code: codes::CTRL_LEFT, down_time: 100 },
                KeyItem { code: codes::S, down_time: 200 },
            ],
            key_down_time: 200,
            action_time: 200,
            action: KeyAction::Down,
            repeat: false,
        },
    )
}

fn touch(id: EventId) -> InputEvent {
    InputEvent::pointer(
        id,
        PointerEvent {
            source: PointerSource::Touch,
            pointer_id: 0,
            action: PointerAction::Down,
            x: 4.0,
            y: 8.0,
            action_time: 300,
        },
    )
}

#[tokio::test]
async fn test_chord_delivered_for_each_event() {
    let h = Harness::start().await;
    let (client, mut queue) = InputClient::connect(h.server.socket_path()).await.unwrap();
    client.ping().await.unwrap();

    let (callback, seen) = recorder();
    let id = client
        .subscribe_key_event(KeyOption::chord(&[codes::CTRL_LEFT], codes::S), &callback)
        .await
        .unwrap();
    assert!(id > 0);

    let first = h.pipeline.dispatch(&ctrl_s(1));
    assert_eq!(first.delivered, 1);
    assert!(timeout(Duration::from_secs(2), queue.dispatch_next()).await.unwrap());
    assert_eq!(settle_queue(&client, &mut queue).await, 0);
    assert_eq!(*seen.lock(), vec![(id, 1)]);

    h.pipeline.dispatch(&ctrl_s(2));
    assert!(timeout(Duration::from_secs(2), queue.dispatch_next()).await.unwrap());
    assert_eq!(settle_queue(&client, &mut queue).await, 0);
    assert_eq!(*seen.lock(), vec![(id, 1), (id, 2)]);

    // Same callback and combination: same subscription
    let again = client
        .subscribe_key_event(KeyOption::chord(&[codes::CTRL_LEFT], codes::S), &callback)
        .await
        .unwrap();
    assert_eq!(again, id);
    assert_eq!(h.driver.total_grabs(), 1);
}

#[tokio::test]
async fn test_disconnect_releases_and_allows_reregistration() {
    let h = Harness::start().await;
    let hotkey = KeyOption::chord(&[codes::META_LEFT], codes::D);

    let (a, _queue_a) = InputClient::connect(h.server.socket_path()).await.unwrap();
    let (callback, _) = recorder();
    a.subscribe_hotkey(hotkey.clone(), &callback).await.unwrap();
    a.add_monitor(EventClass::ALL, &callback).await.unwrap();

    let (b, _queue_b) = InputClient::connect(h.server.socket_path()).await.unwrap();
    let taken = b.subscribe_hotkey(hotkey.clone(), &callback).await;
    assert!(matches!(taken, Err(ClientError::Rejected(InputError::OccupiedByOther))));

    drop(a);
    h.wait_until(|h| h.registry.stats().sessions == 1).await;
    assert_eq!(h.driver.active_grabs(), 0);
    assert_eq!(h.registry.stats().monitors, 0);

    assert!(b.subscribe_hotkey(hotkey, &callback).await.is_ok());
    assert_eq!(h.driver.active_grabs(), 1);
}

#[tokio::test]
async fn test_monitor_consumption_over_the_wire() {
    let h = Harness::start().await;
    let (client, mut queue) = InputClient::connect(h.server.socket_path()).await.unwrap();
    let (callback, seen) = recorder();
    let monitor = client.add_monitor(EventClass::TOUCH, &callback).await.unwrap();

    let outcome = h.pipeline.dispatch(&touch(5));
    assert_eq!(outcome.forwarding(), Forwarding::AwaitConsumption);
    assert!(timeout(Duration::from_secs(2), queue.dispatch_next()).await.unwrap());
    assert_eq!(*seen.lock(), vec![(monitor, 5)]);
    assert_eq!(h.registry.settle(5), Settlement::Pending);

    client.mark_consumed(monitor, 5).await.unwrap();
    client.mark_consumed(monitor, 5).await.unwrap();
    assert_eq!(h.registry.settle(5), Settlement::Consumed);

    let unknown = client.mark_consumed(monitor + 100, 5).await;
    assert!(matches!(unknown, Err(ClientError::Rejected(InputError::NotFound))));
}

#[tokio::test]
async fn test_consumed_event_never_reaches_default_target() {
    let h = Harness::start().await;
    let (client, mut queue) = InputClient::connect(h.server.socket_path()).await.unwrap();
    let (callback, seen) = recorder();
    let monitor = client.add_monitor(EventClass::TOUCH, &callback).await.unwrap();

    let target = Arc::new(RecordingTarget::default());
    let pipeline = Arc::new(
        Pipeline::new(Arc::clone(&h.registry), target.clone()).with_consumption_timeout(Duration::from_secs(30)),
    );
    let (tx, event_rx) = mpsc::channel(8);
    let runner = Arc::clone(&pipeline);
    let run = tokio::spawn(async move { runner.run(event_rx).await });

    tx.send(touch(7)).await.unwrap();
    assert!(timeout(Duration::from_secs(2), queue.dispatch_next()).await.unwrap());
    assert_eq!(*seen.lock(), vec![(monitor, 7)]);
    client.mark_consumed(monitor, 7).await.unwrap();

    // An event the monitor leaves alone still goes through once the stream ends
    tx.send(touch(8)).await.unwrap();
    assert!(timeout(Duration::from_secs(2), queue.dispatch_next()).await.unwrap());
    drop(tx);
    run.await.unwrap();
    assert_eq!(*target.forwarded.lock(), vec![8]);
}

#[tokio::test]
async fn test_removed_monitor_not_invoked() {
    let h = Harness::start().await;
    let (client, mut queue) = InputClient::connect(h.server.socket_path()).await.unwrap();
    let (callback, seen) = recorder();
    let monitor = client.add_monitor(EventClass::TOUCH, &callback).await.unwrap();

    h.pipeline.dispatch(&touch(1));
    client.remove_monitor(monitor).await.unwrap();
    // Let any delivery still in flight reach the client
    client.ping().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(queue.drain(), 0);
    assert!(seen.lock().is_empty());
}
