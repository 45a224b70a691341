//! Dedicated writer task for outbound packets.
//!
//! Every connection owns one writer task fed through an mpsc channel.
//! Callers never touch the socket directly: they hand over a pre-framed
//! [`OutboundPacket`] and the task batches whatever is queued into
//! vectored writes, retrying partial writes until each packet is fully on
//! the wire.
//!
//! # Architecture
//!
//! ```text
//! ClientSession ─┐
//! reader task   ─┼─► mpsc::Sender<OutboundPacket> ─► Writer Task ─► socket
//! dispatcher    ─┘
//! ```
//!
//! A write error (broken pipe, reset) ends the task with an error; the
//! owning connection treats that as fatal and aborts.

use std::io::IoSlice;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{FramewireError, Result};
use crate::protocol::wire_format::{
    fragment_count, fragment_len, max_total_length, store_byte, store_long, Header,
    BASE_HEADER_SIZE, MAX_ORDINARY_LENGTH,
};
use crate::protocol::{ErrorCode, PacketType};

/// Default maximum pending packets before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum packets to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A packet already cut into wire segments.
///
/// Small payloads become `[header, payload]`. Oversized payloads become a
/// fragment-start header followed by `[fragment header, chunk]` pairs whose
/// chunks are zero-copy slices of the original payload.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    segments: Vec<Bytes>,
    size: usize,
}

impl OutboundPacket {
    /// Frame a payload for the wire, fragmenting above `max_datasize`.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` if the payload cannot be represented even when
    /// fragmented.
    ///
    /// # Example
    ///
    /// ```
    /// use framewire::protocol::{ErrorCode, PacketType};
    /// use framewire::writer::OutboundPacket;
    ///
    /// let small = OutboundPacket::encode(
    ///     PacketType::Reply, 0x0D, 1, ErrorCode::Success, "[FOO]".into(), 512,
    /// ).unwrap();
    /// assert_eq!(small.size(), 5 + 5);
    /// ```
    pub fn encode(
        kind: PacketType,
        code: u8,
        seq: u8,
        status: ErrorCode,
        payload: Bytes,
        max_datasize: usize,
    ) -> Result<Self> {
        let max_datasize = max_datasize.clamp(1, MAX_ORDINARY_LENGTH);
        let total = payload.len();
        let mut segments = Vec::new();

        if total <= max_datasize {
            let header = Header::ordinary(total as u16, code, seq);
            segments.push(head_bytes(header, kind, status, None));
            if !payload.is_empty() {
                segments.push(payload);
            }
        } else {
            if total > max_total_length(max_datasize) || total > u32::MAX as usize {
                return Err(FramewireError::Status(ErrorCode::InvalidParameters));
            }
            let header = Header::fragment_start(code, seq);
            segments.push(head_bytes(header, kind, status, Some(total as u32)));
            for index in 0..fragment_count(total, max_datasize) {
                let start = index * max_datasize;
                let len = fragment_len(index, total, max_datasize);
                let header = Header::fragment(index as u16, code, seq);
                segments.push(Bytes::copy_from_slice(&header.encode()));
                segments.push(payload.slice(start..start + len));
            }
        }

        let size = segments.iter().map(Bytes::len).sum();
        Ok(Self { segments, size })
    }

    /// Total size on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of wire segments (headers and data chunks).
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Concatenate every segment; used by tests and diagnostics.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }
}

/// Encode the header prefix plus status byte and total length where present.
fn head_bytes(header: Header, kind: PacketType, status: ErrorCode, total: Option<u32>) -> Bytes {
    let has_status = kind.has_status();
    let len = BASE_HEADER_SIZE + header.extra_len(has_status);
    let mut buf = BytesMut::zeroed(len);
    buf[..BASE_HEADER_SIZE].copy_from_slice(&header.encode());
    if has_status {
        store_byte(status.to_status_byte(), &mut buf, BASE_HEADER_SIZE);
    }
    if let Some(total) = total {
        store_long(total, &mut buf, len - 4);
    }
    buf.freeze()
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending packets before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the packet queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending packets to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundPacket>,
    pending: Arc<AtomicUsize>,
    bytes_written: Arc<AtomicU64>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundPacket>,
        pending: Arc<AtomicUsize>,
        bytes_written: Arc<AtomicU64>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            bytes_written,
            max_pending,
            timeout,
        }
    }

    /// Send a packet to the writer task, waiting out backpressure.
    pub async fn send(&self, packet: OutboundPacket) -> Result<()> {
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(packet).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            FramewireError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_millis(1);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(FramewireError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Try to send a packet without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, packet: OutboundPacket) -> Result<()> {
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            return Err(FramewireError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(packet).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => FramewireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => FramewireError::ConnectionClosed,
            }
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Total bytes the task has put on the wire.
    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending packets.
///
/// The task ends cleanly once every handle is dropped and the queue is
/// drained, shutting down the write half. It ends with an error on the
/// first failed write.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let bytes_written = Arc::new(AtomicU64::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        bytes_written.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending, bytes_written));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundPacket>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    bytes_written: Arc<AtomicU64>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(p) => p,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let written = write_batch(&mut writer, &batch).await?;
        bytes_written.fetch_add(written as u64, Ordering::Release);

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of packets using vectored writes, finishing partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundPacket]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundPacket::size).sum();
    if total_size == 0 {
        return Ok(0);
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(FramewireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(total_written)
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundPacket], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::new();
    let mut offset = 0;

    for segment in batch.iter().flat_map(|p| p.segments.iter()) {
        let end = offset + segment.len();
        if skip_bytes < end {
            let start_in_segment = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&segment[start_in_segment..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn request(code: u8, seq: u8, payload: &'static [u8]) -> OutboundPacket {
        OutboundPacket::encode(
            PacketType::Request,
            code,
            seq,
            ErrorCode::Success,
            Bytes::from_static(payload),
            512,
        )
        .unwrap()
    }

    #[test]
    fn test_ordinary_encoding() {
        let packet = request(0x0D, 3, b"hello");
        assert_eq!(packet.segment_count(), 2);
        assert_eq!(packet.to_vec(), b"\x00\x05\x0D\x03hello");
    }

    #[test]
    fn test_reply_has_status_byte() {
        let packet = OutboundPacket::encode(
            PacketType::Reply,
            0x10,
            1,
            ErrorCode::NotLocked,
            Bytes::new(),
            512,
        )
        .unwrap();
        assert_eq!(packet.to_vec(), vec![0, 0, 0x10, 1, 0x10]);
    }

    #[test]
    fn test_fragmented_encoding() {
        let payload = Bytes::from(vec![7u8; 1100]);
        let packet =
            OutboundPacket::encode(PacketType::Reply, 0x0D, 2, ErrorCode::Success, payload, 512)
                .unwrap();
        let bytes = packet.to_vec();

        // start header: sentinel, code, seq, status, total
        assert_eq!(&bytes[..9], &[0xFF, 0xFF, 0x0D, 2, 0, 0, 0, 0x04, 0x4C]);
        // 3 fragments: 512, 512, 76
        assert_eq!(&bytes[9..13], &[0x80, 0x00, 0x0D, 2]);
        assert_eq!(&bytes[13 + 512..17 + 512], &[0x80, 0x01, 0x0D, 2]);
        assert_eq!(packet.size(), 9 + 3 * 4 + 1100);
        assert_eq!(packet.segment_count(), 1 + 3 * 2);
    }

    #[test]
    fn test_boundary_payload_not_fragmented() {
        let packet = OutboundPacket::encode(
            PacketType::Request,
            0x19,
            0,
            ErrorCode::Success,
            Bytes::from(vec![1u8; 512]),
            512,
        )
        .unwrap();
        assert_eq!(packet.size(), 4 + 512);
    }

    #[test]
    fn test_unrepresentable_payload_rejected() {
        let result = OutboundPacket::encode(
            PacketType::Request,
            0x19,
            0,
            ErrorCode::Success,
            Bytes::from(vec![0u8; 0x8000 * 2 + 1]),
            2,
        );
        assert!(matches!(
            result,
            Err(FramewireError::Status(ErrorCode::InvalidParameters))
        ));
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle.send(request(0x0D, 1, b"hello")).await.unwrap();

        let mut buf = vec![0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x05\x0D\x01hello");
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task_default(client);

        for i in 0..10u8 {
            handle.send(request(0x20, i, b"")).await.unwrap();
        }

        let mut buf = vec![0u8; 40];
        server.read_exact(&mut buf).await.unwrap();
        for i in 0..10 {
            assert_eq!(buf[i * 4 + 3], i as u8);
        }
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundPacket>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(
            tx,
            pending,
            Arc::new(AtomicU64::new(0)),
            100,
            Duration::from_secs(1),
        );

        let result = handle.try_send(request(0x20, 0, b""));
        assert!(matches!(result, Err(FramewireError::BackpressureTimeout)));
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![request(0x0D, 1, b"hello")];

        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, BASE_HEADER_SIZE + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 4);
    }

    #[tokio::test]
    async fn test_write_batch_counts_bytes() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| request(0x0D, i, b"abc")).collect();

        let written = write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(written, 5 * 7);
        assert_eq!(buf.into_inner().len(), 5 * 7);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        handle.send(request(0x81, 0, b"")).await.unwrap();
        drop(handle);

        assert!(task.await.unwrap().is_ok());
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 4);
    }

    #[tokio::test]
    async fn test_broken_pipe_ends_task_with_error() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task_default(client);

        let _ = handle.send(request(0x0D, 1, b"hello")).await;
        let result = task.await.unwrap();
        assert!(result.is_err());
    }
}
