//! Unix domain socket server for IPC
//!
//! One task per client reads frames and feeds them to the dispatcher. All
//! outgoing traffic for a client, replies and deliveries alike, goes through
//! a single writer task so frames never interleave. Every request gets a
//! reply, a malformed or unknown one included, so clients pairing replies
//! with requests stay in step. When the peer goes away the session and
//! everything it registered are torn down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::InputError;
use crate::events::{SessionEvent, SessionId};
use crate::handoff;
use crate::pipeline::Delivery;
use crate::registry::Registry;

use super::codec::{CodecError, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use super::dispatcher::Dispatcher;
use super::protocol::{KeyDelivery, MessageTag, Payload, PointerDelivery, Reply};

/// How long queued replies may take to flush once a client stops sending
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-connection framing limits
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    pub max_frame_len: usize,
    /// Consecutive malformed frames tolerated before disconnecting
    pub max_malformed_frames: u32,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_malformed_frames: 8,
        }
    }
}

impl From<&Config> for ServerLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_frame_len: config.max_frame_len,
            max_malformed_frames: config.max_malformed_frames,
        }
    }
}

/// State shared by every client task
struct Shared {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    limits: ServerLimits,
    session_tx: broadcast::Sender<SessionEvent>,
}

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the socket and prepare to serve `registry`
    pub fn new(socket_path: &Path, registry: Arc<Registry>, limits: ServerLimits) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path)
            .context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (session_tx, _) = broadcast::channel(64);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            shared: Arc::new(Shared {
                dispatcher: Dispatcher::new(Arc::clone(&registry)),
                registry,
                limits,
                session_tx,
            }),
            shutdown_tx,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connect and disconnect notifications
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.session_tx.subscribe()
    }

    /// Accept connections until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref()
            .context("server not initialized")?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let shared = Arc::clone(&self.shared);
                        let shutdown_rx = self.shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_client(stream, shared, shutdown_rx).await {
                                warn!(?e, "client handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(?e, "accept error");
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("accept loop stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Serve one client for the lifetime of its connection
    async fn handle_client(
        stream: UnixStream,
        shared: Arc<Shared>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let pid = stream.peer_cred().ok().and_then(|cred| cred.pid());
        let (mut reader, mut writer) = stream.into_split();

        let (outbox_tx, mut outbox_rx) = handoff::channel(shared.registry.callbacks());
        let session = shared
            .registry
            .open_session(pid, outbox_tx)
            .context("failed to open session")?;
        let _ = shared.session_tx.send(SessionEvent::Connected { session, pid });

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<BytesMut>();
        let writer_task = tokio::spawn(async move {
            loop {
                // Replies first, so a client awaiting one is not starved by deliveries
                let frame = tokio::select! {
                    biased;
                    Some(frame) = reply_rx.recv() => frame,
                    Some((_, task)) = outbox_rx.recv() => delivery_frame(&task.event),
                    else => break,
                };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(session, ?e, "write failed");
                    break;
                }
            }
        });

        let result = Self::read_loop(&mut reader, session, &shared, &reply_tx, &mut shutdown_rx).await;

        // Closing the session drops the outbox sender, so the writer ends
        // once it has flushed what is already queued
        drop(reply_tx);
        let released = shared.registry.close_session(session);
        let abort = writer_task.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await.is_err() {
            debug!(session, "writer did not drain in time");
            abort.abort();
        }
        let _ = shared.session_tx.send(SessionEvent::Disconnected { session, released });
        result
    }

    async fn read_loop(
        reader: &mut OwnedReadHalf,
        session: SessionId,
        shared: &Shared,
        reply_tx: &mpsc::UnboundedSender<BytesMut>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut decoder = FrameDecoder::new(shared.limits.max_frame_len);
        let mut malformed = 0u32;

        loop {
            let n = tokio::select! {
                read = reader.read_buf(decoder.buffer_mut()) => {
                    read.context("failed to read from client")?
                }
                _ = shutdown_rx.recv() => {
                    debug!(session, "client handler shutting down");
                    return Ok(());
                }
            };
            if n == 0 {
                debug!(session, "client disconnected");
                return Ok(());
            }

            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        malformed = 0;
                        debug!(session, tag = frame.tag, len = frame.payload.len(), "frame received");
                        let reply = shared
                            .dispatcher
                            .dispatch(session, frame.tag, &frame.payload)
                            .unwrap_or_else(|e| Reply { request: frame.tag, result: e.code() });
                        let _ = reply_tx.send(reply.to_frame(MessageTag::Reply));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        malformed += 1;
                        warn!(session, error = %e, malformed, "skipping malformed frame");
                        if let CodecError::MalformedFrame { tag, .. } = e {
                            let reply = Reply { request: tag, result: InputError::from(e).code() };
                            let _ = reply_tx.send(reply.to_frame(MessageTag::Reply));
                        }
                        if malformed > shared.limits.max_malformed_frames {
                            warn!(session, "frame corruption beyond retry budget, disconnecting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

fn delivery_frame(delivery: &Delivery) -> BytesMut {
    match delivery {
        Delivery::Key { subscription, event_id, event } => KeyDelivery {
            target: *subscription,
            event_id: *event_id,
            event: event.clone(),
        }
        .to_frame(MessageTag::KeyEventDelivery),
        Delivery::HandlerKey { handler, event_id, event } => KeyDelivery {
            target: *handler,
            event_id: *event_id,
            event: event.clone(),
        }
        .to_frame(MessageTag::HandlerKeyDelivery),
        Delivery::Pointer { handler, event_id, event } => PointerDelivery {
            target: *handler,
            event_id: *event_id,
            event: event.clone(),
        }
        .to_frame(MessageTag::PointerEventDelivery),
    }
}
