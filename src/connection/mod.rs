//! One framed, multiplexed stream connection.
//!
//! A [`Connection`] owns a reader task and a writer task for a single
//! byte stream (normally a `TcpStream`):
//!
//! ```text
//!             ┌──────────────┐  OutboundPacket  ┌─────────────┐
//!  call() ───►│  SeqTable    │ ───────────────► │ writer task │ ──► socket
//!             │  (128 slots) │                  └─────────────┘
//!             └──────▲───────┘
//!                    │ reply matched by (seq, code)
//!             ┌──────┴───────┐  PacketReader    ┌─────────────┐
//!  events ◄───│ reader task  │ ◄─────────────── │   socket    │
//!             └──────────────┘                  └─────────────┘
//! ```
//!
//! On the client side replies are routed to whoever waits on their
//! sequence number and notifications go through the [`NotificationTable`].
//! On the server side every complete Request/Response is forwarded to the
//! dispatcher as a [`ConnectionEvent`].
//!
//! Any transport or protocol failure aborts the connection: it is marked
//! dead, every pending waiter fails with `ConnectionClosed`, and a single
//! `Closed` event is emitted.

mod notify;
mod seq_table;

pub use notify::{NotificationHandler, NotificationTable};
pub use seq_table::{SeqTable, SEQ_SLOTS};

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{map_io_error, FramewireError, Result};
use crate::protocol::wire_format::DEFAULT_MAX_DATASIZE;
use crate::protocol::{
    is_notification_code, ErrorCode, NotificationCode, Packet, PacketReader, PacketType,
    ReplyCallback, Role,
};
use crate::writer::{spawn_writer_task, OutboundPacket, WriterConfig, WriterHandle};

/// Fixed ceiling on a blocking request.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

const READ_BUFFER_SIZE: usize = 16 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// What a server-side connection reports to its dispatcher.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete Request or Response arrived.
    Packet { conn: ConnectionId, packet: Packet },
    /// The connection is gone; emitted exactly once.
    Closed { conn: ConnectionId, reason: ErrorCode },
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Fragmentation threshold; must match the peer.
    pub max_datasize: usize,
    pub writer: WriterConfig,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_datasize: DEFAULT_MAX_DATASIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Whoever is waiting for the reply on a sequence number.
enum Waiter {
    Blocking(oneshot::Sender<Result<Packet>>),
    Callback(ReplyCallback),
    Discard,
}

impl Waiter {
    fn deliver(self, result: Result<Packet>) {
        match self {
            Waiter::Blocking(tx) => {
                let _ = tx.send(result);
            }
            Waiter::Callback(callback) => callback(result),
            Waiter::Discard => {}
        }
    }

    /// A blocking waiter whose caller already gave up.
    fn is_abandoned(&self) -> bool {
        matches!(self, Waiter::Blocking(tx) if tx.is_closed())
    }
}

struct Tables {
    seq: SeqTable<Waiter>,
    notifications: NotificationTable,
}

struct Inner {
    id: ConnectionId,
    role: Role,
    label: String,
    max_datasize: usize,
    writer: Mutex<Option<WriterHandle>>,
    tables: Mutex<Tables>,
    alive: AtomicBool,
    close_reason: AtomicU16,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Cheaply cloneable handle to a live (or dead) connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Take ownership of `stream` and start its reader and writer tasks.
    ///
    /// `events` is required for the server role, where every inbound
    /// Request/Response is forwarded; clients pass `None`.
    pub fn spawn<S>(
        stream: S,
        role: Role,
        label: impl Into<String>,
        options: ConnectionOptions,
        events: Option<mpsc::Sender<ConnectionEvent>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, options.writer.clone());
        let shutdown = Arc::new(Notify::new());

        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            label: label.into(),
            max_datasize: options.max_datasize,
            writer: Mutex::new(Some(writer)),
            tables: Mutex::new(Tables {
                seq: SeqTable::new(),
                notifications: NotificationTable::new(),
            }),
            alive: AtomicBool::new(true),
            close_reason: AtomicU16::new(ErrorCode::Success.as_wire()),
            shutdown: shutdown.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        tracing::debug!(conn = inner.id, peer = %inner.label, ?role, "Connection established");

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            read_half,
            shutdown,
            events,
        ));

        let weak = Arc::downgrade(&inner);
        let watcher = tokio::spawn(async move {
            let reason = match writer_task.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    tracing::debug!("Write failed: {}", e);
                    e.code()
                }
                Err(_) => ErrorCode::SocketError,
            };
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.abort(reason);
            }
        });

        lock(&inner.tasks).extend([reader, watcher]);
        Connection { inner }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Peer description used in logs.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[inline]
    pub fn max_datasize(&self) -> usize {
        self.inner.max_datasize
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Why the connection died, or `Success` while it is alive.
    pub fn close_reason(&self) -> ErrorCode {
        ErrorCode::from_wire(self.inner.close_reason.load(Ordering::Acquire))
            .unwrap_or(ErrorCode::SocketError)
    }

    /// Requests currently waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.tables().seq.outstanding()
    }

    /// Bytes written to the socket so far.
    pub fn bytes_written(&self) -> u64 {
        lock(&self.inner.writer)
            .as_ref()
            .map_or(0, WriterHandle::bytes_written)
    }

    /// Send a request and wait up to [`REPLY_TIMEOUT`] for its reply.
    pub async fn call(&self, packet: Packet) -> Result<Packet> {
        self.call_timeout(packet, REPLY_TIMEOUT).await
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// On timeout the sequence slot is released, so a late reply finds no
    /// waiter and is discarded.
    pub async fn call_timeout(&self, packet: Packet, timeout: Duration) -> Result<Packet> {
        let code = packet.code();
        let (tx, rx) = oneshot::channel();
        let seq = self.send_request(packet, Waiter::Blocking(tx)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FramewireError::ConnectionClosed),
            Err(_) => {
                let released = self.tables().seq_release_if(seq, Waiter::is_abandoned);
                tracing::warn!(
                    conn = self.id(),
                    code,
                    seq,
                    released,
                    "No reply within {:?}",
                    timeout
                );
                Err(FramewireError::Timeout)
            }
        }
    }

    /// Send a request without blocking.
    ///
    /// The packet's receive callback, if any, fires when the reply arrives
    /// or the connection dies; without one the reply is discarded.
    pub async fn submit(&self, mut packet: Packet) -> Result<u8> {
        let waiter = match packet.take_recv_callback() {
            Some(callback) => Waiter::Callback(callback),
            None => Waiter::Discard,
        };
        self.send_request(packet, waiter).await
    }

    async fn send_request(&self, packet: Packet, waiter: Waiter) -> Result<u8> {
        self.ensure_alive()?;
        let writer = self.writer()?;
        let code = packet.code();
        let seq = self
            .tables()
            .seq
            .attach(code, waiter)
            .ok_or(FramewireError::Status(ErrorCode::ResourceLimit))?;

        let sent = match OutboundPacket::encode(
            PacketType::Request,
            code,
            seq,
            ErrorCode::Success,
            packet.into_payload(),
            self.inner.max_datasize,
        ) {
            Ok(outbound) => writer.send(outbound).await,
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            self.tables().seq.release(seq);
            return Err(e);
        }
        Ok(seq)
    }

    /// Queue an arbitrary packet, waiting out backpressure.
    pub async fn send_packet(
        &self,
        kind: PacketType,
        code: u8,
        seq: u8,
        status: ErrorCode,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_alive()?;
        let outbound =
            OutboundPacket::encode(kind, code, seq, status, payload, self.inner.max_datasize)?;
        self.writer()?.send(outbound).await
    }

    /// Queue an arbitrary packet without waiting.
    pub fn try_send_packet(
        &self,
        kind: PacketType,
        code: u8,
        seq: u8,
        status: ErrorCode,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_alive()?;
        let outbound =
            OutboundPacket::encode(kind, code, seq, status, payload, self.inner.max_datasize)?;
        self.writer()?.try_send(outbound)
    }

    /// Claim a sequence number for a notification that expects a response.
    pub fn reserve_seq(&self, code: u8) -> Option<u8> {
        self.tables().seq.attach(code, Waiter::Discard)
    }

    /// Match a response against a reserved sequence number.
    pub fn complete_seq(&self, seq: u8, code: u8) -> bool {
        self.tables().seq.complete(seq, code).is_some()
    }

    /// Free a sequence number without a response.
    pub fn release_seq(&self, seq: u8) -> bool {
        self.tables().seq.release(seq).is_some()
    }

    /// Replace the client-side handler for a notification code.
    pub fn set_notification_handler<F>(&self, code: NotificationCode, handler: F)
    where
        F: Fn(&Packet) -> ErrorCode + Send + Sync + 'static,
    {
        self.tables().notifications.set(code, handler);
    }

    /// Close the connection locally. Queued packets are still flushed.
    pub fn close(&self) {
        self.abort(ErrorCode::NoSuchConnection);
    }

    /// Mark the connection dead and fail everything waiting on it.
    fn abort(&self, reason: ErrorCode) {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner
            .close_reason
            .store(reason.as_wire(), Ordering::Release);
        tracing::info!(conn = self.id(), peer = %self.label(), %reason, "Connection closed");

        lock(&self.inner.writer).take();
        self.inner.shutdown.notify_one();

        let waiters = self.tables().seq.drain();
        for waiter in waiters {
            waiter.deliver(Err(FramewireError::ConnectionClosed));
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(FramewireError::ConnectionClosed)
        }
    }

    fn writer(&self) -> Result<WriterHandle> {
        lock(&self.inner.writer)
            .clone()
            .ok_or(FramewireError::ConnectionClosed)
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.inner.tables)
    }

    /// Hand a complete inbound packet to whoever should see it.
    async fn route(&self, packet: Packet, events: Option<&mpsc::Sender<ConnectionEvent>>) {
        match packet.kind() {
            PacketType::Reply => {
                let waiter = self.tables().seq.complete(packet.seq(), packet.code());
                match waiter {
                    Some(waiter) => waiter.deliver(Ok(packet)),
                    None => tracing::debug!(
                        conn = self.id(),
                        code = packet.code(),
                        seq = packet.seq(),
                        "Discarding reply nobody is waiting for"
                    ),
                }
            }
            PacketType::Notification => {
                let handler = self.tables().notifications.get(packet.code());
                let status = match handler {
                    Some(handler) => handler(&packet),
                    None => {
                        tracing::debug!(code = packet.code(), "Unknown notification code");
                        ErrorCode::InvalidRequest
                    }
                };
                let expects_response = NotificationCode::from_wire(packet.code())
                    .is_some_and(NotificationCode::expects_response);
                if expects_response {
                    let result = self
                        .send_packet(
                            PacketType::Response,
                            packet.code(),
                            packet.seq(),
                            status,
                            Bytes::new(),
                        )
                        .await;
                    if let Err(e) = result {
                        tracing::warn!(conn = self.id(), "Failed to answer notification: {}", e);
                    }
                }
            }
            PacketType::Request | PacketType::Response => match events {
                Some(events) => {
                    let event = ConnectionEvent::Packet {
                        conn: self.id(),
                        packet,
                    };
                    if events.send(event).await.is_err() {
                        tracing::debug!(conn = self.id(), "Dispatcher gone, dropping packet");
                    }
                }
                None => tracing::warn!(
                    conn = self.id(),
                    code = packet.code(),
                    "Unexpected {} on a client connection",
                    if is_notification_code(packet.code()) { "response" } else { "request" }
                ),
            },
        }
    }
}

impl Tables {
    fn seq_release_if(&mut self, seq: u8, pred: impl FnOnce(&Waiter) -> bool) -> bool {
        if self.seq.peek(seq).is_some_and(pred) {
            self.seq.release(seq).is_some()
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.label)
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reader task: socket bytes → packets → routing.
async fn read_loop<R>(
    weak: Weak<Inner>,
    mut reader: R,
    shutdown: Arc<Notify>,
    events: Option<mpsc::Sender<ConnectionEvent>>,
) where
    R: AsyncRead + Unpin,
{
    let Some((id, role, max_datasize)) = weak
        .upgrade()
        .map(|inner| (inner.id, inner.role, inner.max_datasize))
    else {
        return;
    };
    let mut packet_reader = PacketReader::new(role, max_datasize);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break ErrorCode::NoSuchConnection,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(conn = id, "Read failed: {}", e);
                    break map_io_error(e.kind());
                }
            },
            _ = shutdown.notified() => break ErrorCode::NoSuchConnection,
        };

        let packets = match packet_reader.push(&buf[..n]) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!(conn = id, "Aborting connection: {}", e);
                break e.code();
            }
        };

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let conn = Connection { inner };
        for packet in packets {
            conn.route(packet, events.as_ref()).await;
        }
    };

    let reason = match weak.upgrade() {
        Some(inner) => {
            let conn = Connection { inner };
            conn.abort(reason);
            conn.close_reason()
        }
        None => reason,
    };

    if let Some(events) = events {
        let _ = events
            .send(ConnectionEvent::Closed { conn: id, reason })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestCode;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn client_pair() -> (Connection, DuplexStream) {
        let (near, far) = duplex(64 * 1024);
        let conn = Connection::spawn(near, Role::Client, "test", ConnectionOptions::default(), None);
        (conn, far)
    }

    async fn read_request(far: &mut DuplexStream) -> (u8, u8, Vec<u8>) {
        let mut head = [0u8; 4];
        far.read_exact(&mut head).await.unwrap();
        let len = u16::from_be_bytes([head[0], head[1]]) as usize;
        let mut body = vec![0u8; len];
        far.read_exact(&mut body).await.unwrap();
        (head[2], head[3], body)
    }

    async fn write_reply(far: &mut DuplexStream, code: u8, seq: u8, status: u8, body: &[u8]) {
        let mut bytes = (body.len() as u16).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[code, seq, status]);
        bytes.extend_from_slice(body);
        far.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_matches_reply() {
        let (conn, mut far) = client_pair();
        let code = RequestCode::GetFrame.as_wire();

        let call = tokio::spawn({
            let conn = conn.clone();
            async move {
                conn.call(Packet::with_payload(PacketType::Request, code, 0, b"\0\x01FOO\0"))
                    .await
            }
        });

        let (got_code, seq, body) = read_request(&mut far).await;
        assert_eq!(got_code, code);
        assert_eq!(body, b"\0\x01FOO\0");
        write_reply(&mut far, code, seq, 0, b"[FOO]").await;

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.status(), ErrorCode::Success);
        assert_eq!(reply.payload(), b"[FOO]");
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_reverse_order_replies_not_swapped() {
        let (conn, mut far) = client_pair();

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call(Packet::with_payload(PacketType::Request, 0x21, 0, b"a\0")).await }
        });
        let (_, seq_a, _) = read_request(&mut far).await;
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call(Packet::with_payload(PacketType::Request, 0x21, 0, b"b\0")).await }
        });
        let (_, seq_b, _) = read_request(&mut far).await;
        assert_ne!(seq_a, seq_b);

        write_reply(&mut far, 0x21, seq_b, 0, b"B\0").await;
        write_reply(&mut far, 0x21, seq_a, 0, b"A\0").await;

        assert_eq!(first.await.unwrap().unwrap().payload(), b"A\0");
        assert_eq!(second.await.unwrap().unwrap().payload(), b"B\0");
    }

    #[tokio::test]
    async fn test_callback_mode() {
        let (conn, mut far) = client_pair();
        let (tx, rx) = oneshot::channel();

        let mut packet = Packet::new(PacketType::Request, 0x20, 0);
        packet.set_recv_callback(move |result| {
            let _ = tx.send(result.map(|p| p.status()));
        });
        let seq = conn.submit(packet).await.unwrap();

        let (_, got_seq, _) = read_request(&mut far).await;
        assert_eq!(got_seq, seq);
        write_reply(&mut far, 0x20, seq, 0, b"").await;

        assert_eq!(rx.await.unwrap().unwrap(), ErrorCode::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot_and_discards_late_reply() {
        let (conn, mut far) = client_pair();

        let result = conn
            .call(Packet::with_payload(PacketType::Request, 0x0D, 0, b"\0\x01X\0"))
            .await;
        assert!(matches!(result, Err(FramewireError::Timeout)));
        assert_eq!(conn.outstanding(), 0);

        let (_, seq, _) = read_request(&mut far).await;
        write_reply(&mut far, 0x0D, seq, 0, b"[X]").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(conn.is_alive());
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_notification_answered_with_response() {
        let (conn, mut far) = client_pair();
        let _ = &conn;

        far.write_all(&[0, 0, 0x80, 9]).await.unwrap();

        let mut response = [0u8; 5];
        far.read_exact(&mut response).await.unwrap();
        assert_eq!(response, [0, 0, 0x80, 9, 0]);
    }

    #[tokio::test]
    async fn test_custom_notification_handler() {
        let (conn, mut far) = client_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_notification_handler(NotificationCode::PersonalMessage, move |p| {
            let _ = tx.send(p.payload().to_vec());
            ErrorCode::Success
        });

        far.write_all(&[0, 6, 0x84, 0, b'b', b'o', b'b', 0, b'!', 0])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"bob\0!\0");
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_calls() {
        let (conn, mut far) = client_pair();

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call(Packet::new(PacketType::Request, 0x20, 0)).await }
        });
        read_request(&mut far).await;
        drop(far);

        assert!(matches!(
            call.await.unwrap(),
            Err(FramewireError::ConnectionClosed)
        ));
        assert!(!conn.is_alive());
        assert_eq!(conn.close_reason(), ErrorCode::NoSuchConnection);
        assert!(conn.call(Packet::new(PacketType::Request, 0x20, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_protocol_violation_aborts() {
        let (conn, mut far) = client_pair();
        far.write_all(&[0, 0, 0xFF, 0xFF]).await.unwrap();

        for _ in 0..100 {
            if !conn.is_alive() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!conn.is_alive());
        assert_eq!(conn.close_reason(), ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn test_server_role_forwards_events() {
        let (near, mut far) = duplex(4096);
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::spawn(near, Role::Server, "peer", ConnectionOptions::default(), Some(tx));

        far.write_all(&[0, 0, 0x20, 4]).await.unwrap();
        match rx.recv().await.unwrap() {
            ConnectionEvent::Packet { conn: id, packet } => {
                assert_eq!(id, conn.id());
                assert_eq!(packet.kind(), PacketType::Request);
                assert_eq!(packet.seq(), 4);
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(far);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Closed { .. }
        ));
    }
}
