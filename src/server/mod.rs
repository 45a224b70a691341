//! Server dispatcher.
//!
//! One [`ServerDispatcher`] owns every piece of server state. Each accepted
//! socket becomes a [`Connection`] whose reader task forwards complete
//! Request and Response packets over a channel; the dispatcher runs the
//! matching handler, queues the reply, then queues whatever notifications
//! the handler produced. Handlers therefore never run concurrently and the
//! state needs no locking.
//!
//! The dispatcher only ever waits for its next wakeup. Replies and
//! notifications go to each connection's writer queue without waiting; a
//! client whose queue is full has stopped reading and is dropped.
//!
//! # Example
//!
//! ```no_run
//! use framewire::config::NetConfig;
//! use framewire::frames::MemoryBackend;
//! use framewire::server::ServerDispatcher;
//!
//! #[tokio::main]
//! async fn main() -> framewire::Result<()> {
//!     let backend = MemoryBackend::new().with_database("testdb", Vec::new());
//!     let mut server = ServerDispatcher::bind(NetConfig::default(), backend).await?;
//!     server.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```

mod handlers;
mod state;
mod stats;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionId, ConnectionOptions};
use crate::error::{FramewireError, Result};
use crate::event_list::EventList;
use crate::frames::FrameBackend;
use crate::handler::{HandlerContext, HandlerRegistry, Outcome};
use crate::protocol::{ErrorCode, NotificationCode, Packet, PacketType, PayloadWriter, Role};

pub use handlers::{build_registry, MAX_MESSAGE_LEN};
pub use state::{ClientState, DbRef, OpenDb, Outgoing, ServerState, TimeoutAction, MAX_DATABASES};
pub use stats::ServerStatistics;

/// Bound on packets buffered between reader tasks and the dispatcher.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Wait used by [`ServerDispatcher::run`] when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Server clock. Follows tokio's clock so paused-time tests can drive it.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

enum Wakeup {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Event(Option<ConnectionEvent>),
    Timer,
    Shutdown,
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// The server side of the protocol.
pub struct ServerDispatcher {
    state: ServerState,
    events: EventList<ServerState>,
    registry: HandlerRegistry,
    listener: Option<TcpListener>,
    options: ConnectionOptions,
    conn_tx: mpsc::Sender<ConnectionEvent>,
    conn_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ServerDispatcher {
    /// A dispatcher with no listening socket; feed it with
    /// [`attach_stream`](Self::attach_stream).
    pub fn new(config: NetConfig, backend: impl FrameBackend + 'static) -> Self {
        let started = now();
        let interval = config.housekeeping_interval();
        let options = config.connection_options();
        let state = ServerState::new(config, Box::new(backend), started);

        let mut events = EventList::new();
        events.schedule_after(started, interval, move |state: &mut ServerState, now| {
            state.check_idle_clients(now);
            Some(now + interval)
        });

        let (conn_tx, conn_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state,
            events,
            registry: build_registry(),
            listener: None,
            options,
            conn_tx,
            conn_rx,
        }
    }

    /// Create a dispatcher listening on the configured host and port.
    pub async fn bind(config: NetConfig, backend: impl FrameBackend + 'static) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port())).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            peer_mode = config.peer_mode,
            "Server listening"
        );
        let mut server = Self::new(config, backend);
        server.listener = Some(listener);
        Ok(server)
    }

    /// Accept connections from an already-bound listener.
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Replace the dispatch table.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn statistics(&self) -> ServerStatistics {
        self.state.statistics(now())
    }

    pub fn client_count(&self) -> usize {
        self.state.client_count()
    }

    /// Serve an already-open stream as if it had been accepted.
    pub fn attach_stream<S>(&mut self, stream: S, label: impl Into<String>) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::spawn(
            stream,
            Role::Server,
            label,
            self.options.clone(),
            Some(self.conn_tx.clone()),
        );
        let id = self.state.add_client(conn, now());
        tracing::info!(conn = id, "Client connected");
        id
    }

    /// Wait up to `timeout` for something to do, then do it.
    ///
    /// Returns the number of packets handled plus timed events fired.
    /// Cancel safe: the only await is the wait for a wakeup, so a packet
    /// that reached a handler always has its reply queued.
    pub async fn process(&mut self, timeout: Duration) -> usize {
        let never = std::future::pending::<()>();
        tokio::pin!(never);
        self.process_until(timeout, never).await.unwrap_or(0)
    }

    /// Like [`process`](Self::process), but returns `None` without doing
    /// anything once `shutdown` completes.
    async fn process_until<F>(&mut self, timeout: Duration, shutdown: Pin<&mut F>) -> Option<usize>
    where
        F: Future<Output = ()>,
    {
        let mut deadline = now() + timeout;
        if let Some(next) = self.events.next_fire_time() {
            deadline = deadline.min(next);
        }

        let wakeup = tokio::select! {
            biased;
            _ = shutdown => Wakeup::Shutdown,
            accepted = accept(self.listener.as_ref()) => Wakeup::Accepted(accepted),
            event = self.conn_rx.recv() => Wakeup::Event(event),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => Wakeup::Timer,
        };

        let mut handled = 0;
        match wakeup {
            Wakeup::Shutdown => return None,
            Wakeup::Accepted(Ok((stream, addr))) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%addr, "Failed to set TCP_NODELAY: {}", e);
                }
                self.attach_stream(stream, addr.to_string());
            }
            Wakeup::Accepted(Err(e)) => tracing::warn!("Accept failed: {}", e),
            Wakeup::Event(Some(event)) => {
                handled += self.handle_event(event);
                while let Ok(event) = self.conn_rx.try_recv() {
                    handled += self.handle_event(event);
                }
            }
            Wakeup::Event(None) | Wakeup::Timer => {}
        }

        handled += self.events.execute_events(&mut self.state, now());
        self.flush();
        Some(handled)
    }

    /// Serve until `shutdown` completes, then shut down cleanly.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        while self.process_until(IDLE_WAIT, shutdown.as_mut()).await.is_some() {}
        self.shutdown();
        Ok(())
    }

    /// Tell every client the server is going away, then drop them all.
    pub fn shutdown(&mut self) {
        tracing::info!(clients = self.state.client_count(), "Server shutting down");
        let mut going_down = PayloadWriter::new();
        going_down.put_u32(0);
        let going_down = going_down.finish();

        for id in self.state.client_ids() {
            self.state.notify(
                id,
                NotificationCode::ServerGoingDown,
                going_down.clone(),
                None,
            );
            self.state
                .notify(id, NotificationCode::TerminatingConnection, Bytes::new(), None);
        }
        self.flush();
        for id in self.state.client_ids() {
            self.state.remove_client(id, false);
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) -> usize {
        match event {
            ConnectionEvent::Packet { conn, packet } => {
                self.handle_packet(conn, packet);
                1
            }
            ConnectionEvent::Closed { conn, reason } => {
                if self.state.remove_client(conn, true) {
                    tracing::info!(conn, %reason, "Client disconnected");
                }
                self.flush();
                0
            }
        }
    }

    fn handle_packet(&mut self, id: ConnectionId, packet: Packet) {
        let now = now();
        let Some(client) = self.state.client_mut(id) else {
            tracing::debug!(conn = id, "Packet from a forgotten connection");
            return;
        };
        client.touch(now);
        let conn = client.connection().clone();

        let (code, seq) = (packet.code(), packet.seq());
        let is_request = packet.kind() == PacketType::Request;
        if is_request {
            self.state.stats.request_arrived();
        }

        let outcome = {
            let mut ctx = HandlerContext::new(&mut self.state, &mut self.events, id, seq, now);
            self.registry.dispatch(&mut ctx, &packet)
        };

        if let Outcome::Reply(status, body) = outcome {
            match conn.try_send_packet(PacketType::Reply, code, seq, status, body) {
                Ok(()) => {}
                Err(FramewireError::BackpressureTimeout) => {
                    tracing::warn!(conn = id, code, "Reply queue full, dropping client");
                    self.state.drop_client(id);
                }
                Err(e) => tracing::warn!(conn = id, code, "Failed to send reply: {}", e),
            }
        }
        if is_request {
            self.state.stats.reply_sent();
        }
        self.flush();
    }

    /// Send queued notifications and drop clients that stopped answering.
    fn flush(&mut self) {
        loop {
            let outbox = self.state.take_outbox();
            let dropped = self.state.take_dropped();
            if outbox.is_empty() && dropped.is_empty() {
                return;
            }
            for outgoing in outbox {
                self.send_notification(outgoing);
            }
            for id in dropped {
                tracing::warn!(conn = id, "Dropping unresponsive client");
                self.state.remove_client(id, true);
            }
        }
    }

    fn send_notification(&mut self, outgoing: Outgoing) {
        let Outgoing {
            target,
            code,
            payload,
            on_timeout,
        } = outgoing;
        let Some(conn) = self.state.client(target).map(|c| c.connection().clone()) else {
            return;
        };

        let expects_response = code.expects_response();
        let seq = if expects_response {
            match conn.reserve_seq(code.as_wire()) {
                Some(seq) => seq,
                None => {
                    tracing::warn!(conn = target, notification = code.name(), "No free sequence number");
                    return;
                }
            }
        } else {
            0
        };

        let sent = conn.try_send_packet(
            PacketType::Notification,
            code.as_wire(),
            seq,
            ErrorCode::Success,
            payload,
        );
        if let Err(e) = sent {
            tracing::warn!(conn = target, notification = code.name(), "Failed to send: {}", e);
            if expects_response {
                conn.release_seq(seq);
            }
            if matches!(e, FramewireError::BackpressureTimeout) {
                self.state.drop_client(target);
            }
            return;
        }

        let event = if expects_response {
            let timeout = self.state.config().notification_timeout();
            Some(self.events.schedule_after(
                now(),
                timeout,
                move |state: &mut ServerState, _now| {
                    state.notification_timed_out(target, seq, code, on_timeout.clone());
                    None
                },
            ))
        } else {
            None
        };
        self.state.notification_sent(target, seq, event);
    }
}

impl std::fmt::Debug for ServerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDispatcher")
            .field("clients", &self.state.client_count())
            .field("listening", &self.local_addr())
            .field("events", &self.events)
            .finish()
    }
}
