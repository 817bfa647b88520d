//! Logical sockets multiplexed over a device link.
//!
//! A socket is created either by [`Dispatcher::open`](super::Dispatcher::open)
//! or by the device opening a reverse tunnel. Incoming data is queued without
//! bound by the read loop; outgoing data is gated by the write credit the
//! device grants with OKAY packets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use protocol::Command;
use tokio::sync::{mpsc, Notify};

use super::dispatcher::Link;
use crate::error::{ClientError, Result};

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How much a socket may send before the device acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCredit {
    /// Legacy mode: one WRTE may be sent.
    Ready,
    /// Legacy mode: waiting for OKAY.
    Blocked,
    /// Delayed-ack mode: bytes that may be sent.
    Bytes(u32),
}

impl WriteCredit {
    /// Takes credit for up to `wanted` bytes, returning how many may be sent.
    ///
    /// Returns `None` when nothing may be sent yet. Never overdraws.
    pub fn take(&mut self, wanted: usize) -> Option<usize> {
        match *self {
            WriteCredit::Ready => {
                *self = WriteCredit::Blocked;
                Some(wanted)
            }
            WriteCredit::Blocked | WriteCredit::Bytes(0) => None,
            WriteCredit::Bytes(available) => {
                let granted = wanted.min(available as usize);
                *self = WriteCredit::Bytes(available - granted as u32);
                Some(granted)
            }
        }
    }

    /// Applies an OKAY: legacy credit becomes ready, byte credit grows.
    pub fn grant(&mut self, bytes: Option<u32>) {
        *self = match (*self, bytes) {
            (WriteCredit::Bytes(current), Some(extra)) => {
                WriteCredit::Bytes(current.saturating_add(extra))
            }
            (_, Some(extra)) => WriteCredit::Bytes(extra),
            (_, None) => WriteCredit::Ready,
        };
    }
}

/// State shared between a socket's handles and the read loop.
pub(crate) struct SocketShared {
    pub(crate) local_id: u32,
    pub(crate) remote_id: u32,
    pub(crate) service: String,
    pub(crate) local_created: bool,
    credit: Mutex<WriteCredit>,
    credit_changed: Notify,
    closed: AtomicBool,
    close_sent: AtomicBool,
    unread: Mutex<VecDeque<Instant>>,
}

impl SocketShared {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        service: String,
        local_created: bool,
        credit: WriteCredit,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            service,
            local_created,
            credit: Mutex::new(credit),
            credit_changed: Notify::new(),
            closed: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            unread: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds credit from an OKAY and wakes blocked writers.
    pub(crate) fn grant(&self, bytes: Option<u32>) {
        lock(&self.credit).grant(bytes);
        self.credit_changed.notify_waiters();
    }

    /// Replaces the credit outright.
    pub(crate) fn set_credit(&self, credit: WriteCredit) {
        *lock(&self.credit) = credit;
        self.credit_changed.notify_waiters();
    }

    pub(crate) fn credit(&self) -> WriteCredit {
        *lock(&self.credit)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.credit_changed.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    /// Returns true the first time it is called.
    pub(crate) fn claim_close(&self) -> bool {
        !self.close_sent.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn record_enqueued(&self) {
        lock(&self.unread).push_back(Instant::now());
    }

    /// Undoes [`record_enqueued`](Self::record_enqueued) for a chunk that
    /// never reached the queue.
    pub(crate) fn forget_enqueued(&self) {
        lock(&self.unread).pop_back();
    }

    fn record_consumed(&self) {
        lock(&self.unread).pop_front();
    }

    /// Nobody will read the queued chunks any more.
    fn clear_unread(&self) {
        lock(&self.unread).clear();
    }

    /// Age of the oldest chunk the consumer has not picked up.
    pub(crate) fn oldest_unread(&self) -> Option<Duration> {
        lock(&self.unread).front().map(Instant::elapsed)
    }

    /// Waits until up to `wanted` bytes may be sent.
    async fn acquire(&self, wanted: usize) -> Result<usize> {
        loop {
            let notified = self.credit_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(ClientError::SocketClosed);
            }
            if let Some(granted) = lock(&self.credit).take(wanted) {
                return Ok(granted);
            }

            notified.await;
        }
    }
}

/// Sends CLOSE when the last handle is dropped without an explicit close.
struct SocketHandle {
    shared: Arc<SocketShared>,
    link: Arc<Link>,
}

impl SocketHandle {
    async fn close(&self) -> Result<()> {
        self.link.close_socket(&self.shared).await
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if self.shared.close_sent() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            let link = Arc::clone(&self.link);
            runtime.spawn(async move {
                let _ = link.close_socket(&shared).await;
            });
        }
    }
}

/// A bidirectional byte stream to a device service.
pub struct AdbSocket {
    reader: SocketReader,
    writer: SocketWriter,
}

impl AdbSocket {
    pub(crate) fn new(
        shared: Arc<SocketShared>,
        link: Arc<Link>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        let handle = Arc::new(SocketHandle { shared, link });
        Self {
            reader: SocketReader {
                handle: Arc::clone(&handle),
                inbound,
                buffer: BytesMut::new(),
            },
            writer: SocketWriter { handle },
        }
    }

    /// Id chosen by this side.
    pub fn local_id(&self) -> u32 {
        self.writer.handle.shared.local_id
    }

    /// Id chosen by the device.
    pub fn remote_id(&self) -> u32 {
        self.writer.handle.shared.remote_id
    }

    /// Service string the socket was opened for.
    pub fn service(&self) -> &str {
        &self.writer.handle.shared.service
    }

    /// Whether this side opened the socket.
    pub fn is_local_created(&self) -> bool {
        self.writer.handle.shared.local_created
    }

    /// Whether either side has closed the socket.
    pub fn is_closed(&self) -> bool {
        self.writer.handle.shared.is_closed()
    }

    /// Current write credit.
    pub fn write_credit(&self) -> WriteCredit {
        self.writer.handle.shared.credit()
    }

    /// Sends `data`, split into packets no larger than the negotiated payload.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    /// Next chunk of data; `None` once the device closes the socket.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.reader.read().await
    }

    /// Reads exactly `len` bytes.
    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        self.reader.read_exact(len).await
    }

    /// Returns whatever is already queued without waiting.
    pub fn try_read_available(&mut self) -> Option<Bytes> {
        self.reader.try_read_available()
    }

    /// Reads until the device closes the socket.
    pub async fn read_to_end(&mut self) -> Bytes {
        self.reader.read_to_end().await
    }

    /// Sends CLOSE. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.writer.close().await
    }

    /// Splits into halves usable from different tasks.
    pub fn split(self) -> (SocketReader, SocketWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for AdbSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbSocket")
            .field("local_id", &self.local_id())
            .field("remote_id", &self.remote_id())
            .field("service", &self.service())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read half of a socket.
pub struct SocketReader {
    handle: Arc<SocketHandle>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    buffer: BytesMut,
}

impl SocketReader {
    async fn recv(&mut self) -> Option<Bytes> {
        let chunk = self.inbound.recv().await?;
        self.handle.shared.record_consumed();
        Some(chunk)
    }

    /// Next chunk of data; `None` once the device closes the socket.
    pub async fn read(&mut self) -> Option<Bytes> {
        if !self.buffer.is_empty() {
            return Some(self.buffer.split().freeze());
        }
        self.recv().await
    }

    /// Reads exactly `len` bytes, failing with [`ClientError::SocketClosed`]
    /// if the stream ends first.
    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        while self.buffer.len() < len {
            match self.recv().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => return Err(ClientError::SocketClosed),
            }
        }
        Ok(self.buffer.split_to(len).freeze())
    }

    /// Returns buffered and already queued data without waiting.
    pub fn try_read_available(&mut self) -> Option<Bytes> {
        while let Ok(chunk) = self.inbound.try_recv() {
            self.handle.shared.record_consumed();
            self.buffer.extend_from_slice(&chunk);
        }
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    /// Reads until the device closes the socket.
    pub async fn read_to_end(&mut self) -> Bytes {
        while let Some(chunk) = self.recv().await {
            self.buffer.extend_from_slice(&chunk);
        }
        self.buffer.split().freeze()
    }

    /// Sends CLOSE. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

impl Drop for SocketReader {
    fn drop(&mut self) {
        // Closed first so later deliveries fail instead of queueing.
        self.inbound.close();
        self.handle.shared.clear_unread();
    }
}

/// Write half of a socket. Dropping it alone does not close the socket.
#[derive(Clone)]
pub struct SocketWriter {
    handle: Arc<SocketHandle>,
}

impl SocketWriter {
    /// Sends `data`, split into packets no larger than the negotiated
    /// payload, each waiting for write credit.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let shared = &self.handle.shared;
        let link = &self.handle.link;
        let max_payload = link.params().max_payload_size as usize;

        let mut offset = 0;
        while offset < data.len() {
            let wanted = (data.len() - offset).min(max_payload);
            let granted = shared.acquire(wanted).await?;
            let chunk = Bytes::copy_from_slice(&data[offset..offset + granted]);
            link.send_packet(Command::Write, shared.local_id, shared.remote_id, chunk)
                .await?;
            offset += granted;
        }
        Ok(())
    }

    /// Whether either side has closed the socket.
    pub fn is_closed(&self) -> bool {
        self.handle.shared.is_closed()
    }

    /// Sends CLOSE. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_credit_single_packet() {
        let mut credit = WriteCredit::Ready;
        assert_eq!(credit.take(4096), Some(4096));
        assert_eq!(credit, WriteCredit::Blocked);
        assert_eq!(credit.take(1), None);

        credit.grant(None);
        assert_eq!(credit, WriteCredit::Ready);
    }

    #[test]
    fn test_byte_credit_never_overdraws() {
        let mut credit = WriteCredit::Bytes(100);
        assert_eq!(credit.take(60), Some(60));
        assert_eq!(credit.take(60), Some(40));
        assert_eq!(credit, WriteCredit::Bytes(0));
        assert_eq!(credit.take(1), None);

        credit.grant(Some(10));
        assert_eq!(credit, WriteCredit::Bytes(10));
        credit.grant(Some(u32::MAX));
        assert_eq!(credit, WriteCredit::Bytes(u32::MAX));
    }

    #[test]
    fn test_grant_switches_blocked_to_bytes() {
        let mut credit = WriteCredit::Blocked;
        credit.grant(Some(32));
        assert_eq!(credit, WriteCredit::Bytes(32));
    }

    #[test]
    fn test_unread_tracking() {
        let shared = SocketShared::new(1, 2, "shell:".to_string(), true, WriteCredit::Ready);
        assert!(shared.oldest_unread().is_none());

        shared.record_enqueued();
        shared.record_enqueued();
        assert!(shared.oldest_unread().is_some());

        shared.record_consumed();
        shared.record_consumed();
        assert!(shared.oldest_unread().is_none());
    }

    #[test]
    fn test_claim_close_once() {
        let shared = SocketShared::new(1, 2, "sync:".to_string(), true, WriteCredit::Ready);
        assert!(shared.claim_close());
        assert!(!shared.claim_close());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_grant() {
        let shared = Arc::new(SocketShared::new(
            1,
            2,
            "shell:".to_string(),
            true,
            WriteCredit::Blocked,
        ));

        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.acquire(10).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shared.grant(Some(4));
        assert_eq!(waiter.await.unwrap().unwrap(), 4);
        assert_eq!(shared.credit(), WriteCredit::Bytes(0));
    }

    #[tokio::test]
    async fn test_acquire_fails_when_closed() {
        let shared = Arc::new(SocketShared::new(
            1,
            2,
            "shell:".to_string(),
            true,
            WriteCredit::Blocked,
        ));

        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.acquire(10).await })
        };
        tokio::task::yield_now().await;
        shared.mark_closed();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ClientError::SocketClosed)
        ));
    }
}
