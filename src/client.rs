//! Client side of the IPC protocol
//!
//! `InputClient` issues requests and awaits their replies. A background
//! reader task routes pushed deliveries to the callback registered for the
//! subscription or handler they name, through a handoff queue drained by the
//! caller's own context (`CallbackQueue`).

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{result_from_code, InputError};
use crate::events::{EventClass, EventId, KeyAction};
use crate::handoff::{self, CallbackArena, CallbackHandle, HandoffReceiver, HandoffSender};
use crate::hotkey::{KeyCode, KeyOption};
use crate::ipc::{
    Frame, FrameDecoder, IdRequest, InterceptorRequest, KeyDelivery, KeyMonitorRequest,
    MarkConsumedRequest, MessageTag, MonitorRequest, Payload, PointerDelivery, Reply, SubscribeRequest,
    DEFAULT_MAX_FRAME_LEN,
};
use crate::pipeline::Delivery;
use crate::registry::{HandlerId, SubscriptionId};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Disconnected,

    #[error(transparent)]
    Rejected(#[from] InputError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A closure invoked for each delivery of the entries it is registered with.
/// Clones share identity: registering the same callback twice for one
/// combination yields one subscription.
#[derive(Clone)]
pub struct ClientCallback(Arc<dyn Fn(&Delivery) + Send + Sync>);

impl ClientCallback {
    pub fn new(f: impl Fn(&Delivery) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Identity sent to the service
    pub fn token(&self) -> u64 {
        Arc::as_ptr(&self.0) as *const () as usize as u64
    }

    fn invoke(&self, delivery: &Delivery) {
        (self.0)(delivery)
    }
}

impl std::fmt::Debug for ClientCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientCallback").field(&self.token()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Route {
    Subscription(SubscriptionId),
    Handler(HandlerId),
}

/// Routing change applied once a request succeeds
enum RouteChange {
    Add { route: fn(i32) -> Route, callback: ClientCallback },
    Remove(Route),
}

struct PendingReply {
    tag: u32,
    tx: oneshot::Sender<i32>,
    change: Option<RouteChange>,
}

struct ClientShared {
    /// Replies arrive in request order
    pending: Mutex<VecDeque<PendingReply>>,
    routes: Mutex<HashMap<Route, CallbackHandle>>,
    callbacks: Arc<CallbackArena<ClientCallback>>,
}

impl ClientShared {
    fn handle_frame(&self, frame: Frame, outbox: &HandoffSender<Delivery>) -> std::result::Result<(), InputError> {
        match MessageTag::from_u32(frame.tag) {
            Some(MessageTag::Reply) => {
                let reply = Reply::from_payload(&frame.payload)?;
                self.complete(reply);
            }
            Some(MessageTag::KeyEventDelivery) => {
                let d = KeyDelivery::from_payload(&frame.payload)?;
                let delivery = Delivery::Key { subscription: d.target, event_id: d.event_id, event: d.event };
                self.route(Route::Subscription(d.target), delivery, outbox);
            }
            Some(MessageTag::HandlerKeyDelivery) => {
                let d = KeyDelivery::from_payload(&frame.payload)?;
                let delivery = Delivery::HandlerKey { handler: d.target, event_id: d.event_id, event: d.event };
                self.route(Route::Handler(d.target), delivery, outbox);
            }
            Some(MessageTag::PointerEventDelivery) => {
                let d = PointerDelivery::from_payload(&frame.payload)?;
                let delivery = Delivery::Pointer { handler: d.target, event_id: d.event_id, event: d.event };
                self.route(Route::Handler(d.target), delivery, outbox);
            }
            _ => return Err(InputError::UnknownMessage(frame.tag)),
        }
        Ok(())
    }

    fn complete(&self, reply: Reply) {
        let Some(pending) = self.pending.lock().pop_front() else {
            warn!(request = reply.request, "reply without a pending request");
            return;
        };
        if pending.tag != reply.request {
            warn!(expected = pending.tag, got = reply.request, "reply out of order");
        }

        if reply.result >= 0 {
            match pending.change {
                Some(RouteChange::Add { route, callback }) => {
                    let mut routes = self.routes.lock();
                    // A duplicate subscription comes back with an id already routed
                    routes
                        .entry(route(reply.result))
                        .or_insert_with(|| self.callbacks.insert(callback));
                }
                Some(RouteChange::Remove(route)) => {
                    if let Some(handle) = self.routes.lock().remove(&route) {
                        self.callbacks.release(handle);
                    }
                }
                None => {}
            }
        }
        let _ = pending.tx.send(reply.result);
    }

    fn route(&self, route: Route, delivery: Delivery, outbox: &HandoffSender<Delivery>) {
        let handle = self.routes.lock().get(&route).copied();
        match handle {
            Some(handle) => {
                if outbox.enqueue(handle, delivery).is_err() {
                    debug!(?route, "callback queue closed, delivery dropped");
                }
            }
            None => debug!(?route, "delivery for unknown route dropped"),
        }
    }
}

/// Connection to the input service
pub struct InputClient {
    writer: AsyncMutex<OwnedWriteHalf>,
    shared: Arc<ClientShared>,
    reader_task: JoinHandle<()>,
}

impl InputClient {
    /// Connect to the service. Deliveries are queued on the returned
    /// `CallbackQueue` until its owner drains them.
    pub async fn connect(socket_path: &Path) -> Result<(Self, CallbackQueue)> {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, writer) = stream.into_split();

        let callbacks = Arc::new(CallbackArena::new());
        let (outbox_tx, outbox_rx) = handoff::channel(Arc::clone(&callbacks));
        let shared = Arc::new(ClientShared {
            pending: Mutex::new(VecDeque::new()),
            routes: Mutex::new(HashMap::new()),
            callbacks,
        });

        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared), outbox_tx));
        info!(?socket_path, "connected to input service");

        let client = Self {
            writer: AsyncMutex::new(writer),
            shared,
            reader_task,
        };
        Ok((client, CallbackQueue { rx: outbox_rx }))
    }

    pub async fn ping(&self) -> Result<()> {
        let frame = crate::ipc::encode(MessageTag::Ping.as_u32(), &[]);
        self.request(MessageTag::Ping, frame, None).await.map(|_| ())
    }

    pub async fn subscribe_key_event(&self, option: KeyOption, callback: &ClientCallback) -> Result<SubscriptionId> {
        self.subscribe(MessageTag::SubscribeKey, option, callback).await
    }

    pub async fn unsubscribe_key_event(&self, id: SubscriptionId) -> Result<()> {
        self.remove(MessageTag::UnsubscribeKey, Route::Subscription(id)).await
    }

    pub async fn subscribe_hotkey(&self, option: KeyOption, callback: &ClientCallback) -> Result<SubscriptionId> {
        self.subscribe(MessageTag::SubscribeHotkey, option, callback).await
    }

    pub async fn unsubscribe_hotkey(&self, id: SubscriptionId) -> Result<()> {
        self.remove(MessageTag::UnsubscribeHotkey, Route::Subscription(id)).await
    }

    pub async fn subscribe_key_monitor(
        &self,
        key: KeyCode,
        action: KeyAction,
        callback: &ClientCallback,
    ) -> Result<SubscriptionId> {
        let tag = MessageTag::SubscribeKeyMonitor;
        let frame = KeyMonitorRequest { key, action, token: callback.token() }.to_frame(tag);
        let change = RouteChange::Add { route: Route::Subscription, callback: callback.clone() };
        self.request(tag, frame, Some(change)).await
    }

    pub async fn unsubscribe_key_monitor(&self, id: SubscriptionId) -> Result<()> {
        self.remove(MessageTag::UnsubscribeKeyMonitor, Route::Subscription(id)).await
    }

    pub async fn add_monitor(&self, classes: EventClass, callback: &ClientCallback) -> Result<HandlerId> {
        let tag = MessageTag::AddMonitor;
        let frame = MonitorRequest { classes: classes.bits(), token: callback.token() }.to_frame(tag);
        let change = RouteChange::Add { route: Route::Handler, callback: callback.clone() };
        self.request(tag, frame, Some(change)).await
    }

    pub async fn remove_monitor(&self, id: HandlerId) -> Result<()> {
        self.remove(MessageTag::RemoveMonitor, Route::Handler(id)).await
    }

    pub async fn add_interceptor(
        &self,
        classes: EventClass,
        priority: i32,
        callback: &ClientCallback,
    ) -> Result<HandlerId> {
        let tag = MessageTag::AddInterceptor;
        let frame = InterceptorRequest { classes: classes.bits(), priority, token: callback.token() }.to_frame(tag);
        let change = RouteChange::Add { route: Route::Handler, callback: callback.clone() };
        self.request(tag, frame, Some(change)).await
    }

    pub async fn remove_interceptor(&self, id: HandlerId) -> Result<()> {
        self.remove(MessageTag::RemoveInterceptor, Route::Handler(id)).await
    }

    /// Tell the service one of this client's monitors consumed an event
    pub async fn mark_consumed(&self, monitor: HandlerId, event_id: EventId) -> Result<()> {
        let tag = MessageTag::MarkConsumed;
        let frame = MarkConsumedRequest { monitor, event_id }.to_frame(tag);
        self.request(tag, frame, None).await.map(|_| ())
    }

    async fn subscribe(&self, tag: MessageTag, option: KeyOption, callback: &ClientCallback) -> Result<SubscriptionId> {
        let frame = SubscribeRequest { option, token: callback.token() }.to_frame(tag);
        let change = RouteChange::Add { route: Route::Subscription, callback: callback.clone() };
        self.request(tag, frame, Some(change)).await
    }

    async fn remove(&self, tag: MessageTag, route: Route) -> Result<()> {
        let id = match route {
            Route::Subscription(id) | Route::Handler(id) => id,
        };
        let frame = IdRequest { id }.to_frame(tag);
        self.request(tag, frame, Some(RouteChange::Remove(route))).await.map(|_| ())
    }

    async fn request(&self, tag: MessageTag, frame: BytesMut, change: Option<RouteChange>) -> Result<i32> {
        let (tx, rx) = oneshot::channel();
        {
            // The pending entry is queued under the writer lock so it lines
            // up with the order requests reach the socket
            let mut writer = self.writer.lock().await;
            self.shared.pending.lock().push_back(PendingReply { tag: tag.as_u32(), tx, change });
            writer.write_all(&frame).await?;
        }
        let value = rx.await.map_err(|_| ClientError::Disconnected)?;
        Ok(result_from_code(value)?)
    }
}

impl Drop for InputClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<ClientShared>, outbox: HandoffSender<Delivery>) {
    let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);

    loop {
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                debug!("service closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(?e, "read from service failed");
                break;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    let tag = frame.tag;
                    if let Err(e) = shared.handle_frame(frame, &outbox) {
                        warn!(tag, error = %e, "ignoring message from service");
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(error = %e, "skipping malformed frame"),
            }
        }
    }

    // Waiters see the connection as closed
    shared.pending.lock().clear();
}

/// Owner side of a client's deliveries
pub struct CallbackQueue {
    rx: HandoffReceiver<ClientCallback, Delivery>,
}

impl CallbackQueue {
    /// Invoke the callbacks of every delivery queued so far. Deliveries for
    /// entries removed in the meantime are discarded.
    pub fn drain(&mut self) -> usize {
        self.rx.drain(|callback, delivery| callback.invoke(&delivery))
    }

    /// Wait for one delivery and invoke its callback. Returns false once the
    /// connection is gone and nothing is left.
    pub async fn dispatch_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some((callback, task)) => {
                callback.invoke(&task.event);
                true
            }
            None => false,
        }
    }

    /// Invoke callbacks until the connection is gone
    pub async fn run(mut self) {
        while self.dispatch_next().await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PointerAction, PointerEvent, PointerSource};

    fn mouse(handler: HandlerId, event_id: EventId) -> Delivery {
        let event = PointerEvent {
            source: PointerSource::Mouse,
            pointer_id: 1,
            action: PointerAction::Move,
            x: 0.0,
            y: 0.0,
            action_time: 0,
        };
        Delivery::Pointer { handler, event_id, event }
    }

    #[test]
    fn test_callback_identity() {
        let a = ClientCallback::new(|_| {});
        let b = ClientCallback::new(|_| {});
        assert_eq!(a.token(), a.clone().token());
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_reply_applies_route_changes() {
        let callbacks = Arc::new(CallbackArena::new());
        let (outbox, mut queue) = handoff::channel::<ClientCallback, Delivery>(Arc::clone(&callbacks));
        let shared = ClientShared {
            pending: Mutex::new(VecDeque::new()),
            routes: Mutex::new(HashMap::new()),
            callbacks,
        };
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        let callback = ClientCallback::new(move |_| *counter.lock() += 1);

        let (tx, _rx) = oneshot::channel();
        shared.pending.lock().push_back(PendingReply {
            tag: MessageTag::AddMonitor.as_u32(),
            tx,
            change: Some(RouteChange::Add { route: Route::Handler, callback }),
        });
        shared.complete(Reply { request: MessageTag::AddMonitor.as_u32(), result: 4 });

        shared.route(Route::Handler(4), mouse(4, 1), &outbox);
        shared.route(Route::Handler(5), mouse(5, 1), &outbox);
        assert_eq!(queue.drain(|callback, d| callback.invoke(&d)), 1);
        assert_eq!(*hits.lock(), 1);

        // Removal drops anything still queued for the route
        shared.route(Route::Handler(4), mouse(4, 2), &outbox);
        let (tx, _rx) = oneshot::channel();
        shared.pending.lock().push_back(PendingReply {
            tag: MessageTag::RemoveMonitor.as_u32(),
            tx,
            change: Some(RouteChange::Remove(Route::Handler(4))),
        });
        shared.complete(Reply { request: MessageTag::RemoveMonitor.as_u32(), result: 0 });
        assert_eq!(queue.drain(|_, _| panic!("removed route invoked")), 0);
    }
}
