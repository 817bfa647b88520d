//! Socket multiplexer for an authenticated device link.
//!
//! One read task owns the packet stream and routes every packet to the
//! socket it belongs to. Writers from any task share a single async mutex
//! around the write half so packet boundaries are never interleaved.
//!
//! ```text
//!             ┌──────────── Link ─────────────┐
//!  open() ───▶│ SocketTable (std Mutex)       │◀── read task ◀── FramedRead
//!  write() ──▶│ writer (tokio Mutex) ─────────┼──▶ WriteHalf
//!             │ handlers, state (watch)       │◀── watchdog (optional)
//!             └───────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use protocol::{Command, ConnectionParams, FlowControl, Packet, PacketCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::socket::{lock, AdbSocket, SocketShared, WriteCredit};
use super::write_packet;
use crate::error::{ClientError, Result};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handles sockets the device opens towards the host (reverse tunnels).
///
/// `accept` runs on the read task and must not block; hand the socket to a
/// spawned task for any real work.
pub trait IncomingSocketHandler: Send + Sync {
    /// Takes ownership of a new socket. An error refuses the open.
    fn accept(&self, socket: AdbSocket) -> Result<()>;
}

impl<F> IncomingSocketHandler for F
where
    F: Fn(AdbSocket) -> Result<()> + Send + Sync,
{
    fn accept(&self, socket: AdbSocket) -> Result<()> {
        self(socket)
    }
}

/// Lifecycle of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Packets are flowing.
    Connected,
    /// Closed locally or by the device.
    Closed,
    /// Torn down after a protocol or I/O error.
    Failed(String),
    /// Torn down because a socket left data unread too long.
    Stalled {
        /// Local id of the stalled socket.
        local_id: u32,
        /// Service of the stalled socket.
        service: String,
        /// Age of its oldest unread chunk.
        waited: Duration,
    },
}

impl ConnectionState {
    /// Whether the link is still usable.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Error describing why the link ended, if it has.
    pub fn to_error(&self) -> Option<ClientError> {
        match self {
            ConnectionState::Connected => None,
            ConnectionState::Closed => Some(ClientError::ConnectionLost(
                "connection closed".to_string(),
            )),
            ConnectionState::Failed(reason) => Some(ClientError::ConnectionLost(reason.clone())),
            ConnectionState::Stalled {
                local_id,
                service,
                waited,
            } => Some(ClientError::StalledSocket {
                local_id: *local_id,
                service: service.clone(),
                waited: *waited,
            }),
        }
    }

    fn describe(&self) -> String {
        match self.to_error() {
            Some(err) => err.to_string(),
            None => "connected".to_string(),
        }
    }
}

/// Tunables for the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct DispatcherOptions {
    /// Tear the link down when a socket leaves data unread this long.
    pub read_time_limit: Option<Duration>,
}

struct PendingOpen {
    service: String,
    reply: oneshot::Sender<Result<AdbSocket>>,
}

struct SocketEntry {
    shared: Arc<SocketShared>,
    inbound: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct SocketTable {
    next_id: u32,
    pending: HashMap<u32, PendingOpen>,
    sockets: HashMap<u32, SocketEntry>,
    closing: HashSet<u32>,
    shut_down: bool,
}

impl SocketTable {
    /// Next nonzero id not in use. Ids are handed out in increasing order
    /// and wrap around.
    fn allocate_id(&mut self) -> Option<u32> {
        for _ in 0..=self.sockets.len() + self.pending.len() + self.closing.len() {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            let id = self.next_id;
            if !self.sockets.contains_key(&id)
                && !self.pending.contains_key(&id)
                && !self.closing.contains(&id)
            {
                return Some(id);
            }
        }
        None
    }
}

/// State shared by the dispatcher handle, its tasks and every socket.
pub(crate) struct Link {
    params: ConnectionParams,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    table: Mutex<SocketTable>,
    handlers: Mutex<HashMap<String, Arc<dyn IncomingSocketHandler>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Link {
    pub(crate) fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Writes one packet: header, then payload, then flush.
    pub(crate) async fn send_packet(
        &self,
        command: Command,
        arg0: u32,
        arg1: u32,
        payload: Bytes,
    ) -> Result<()> {
        let packet = Packet::new(command, arg0, arg1, payload);
        let result = {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(self.lost());
            };
            tracing::trace!(
                command = %command,
                arg0,
                arg1,
                len = packet.payload.len(),
                "Sending packet"
            );
            write_packet(writer, &packet).await
        };

        if let Err(e) = result {
            let state = ConnectionState::Failed(format!("write failed: {e}"));
            self.teardown(state).await;
            return Err(self.lost());
        }
        Ok(())
    }

    fn lost(&self) -> ClientError {
        self.state
            .borrow()
            .to_error()
            .unwrap_or_else(|| ClientError::ConnectionLost("connection closed".to_string()))
    }

    /// Closes a socket from this side. Idempotent.
    pub(crate) async fn close_socket(&self, socket: &SocketShared) -> Result<()> {
        if !socket.claim_close() {
            return Ok(());
        }
        socket.mark_closed();
        {
            let mut table = lock(&self.table);
            if table.sockets.remove(&socket.local_id).is_some() {
                table.closing.insert(socket.local_id);
            }
        }
        tracing::debug!(
            local_id = socket.local_id,
            remote_id = socket.remote_id,
            service = %socket.service,
            "Closing socket"
        );
        self.send_packet(Command::Close, socket.local_id, socket.remote_id, Bytes::new())
            .await
    }

    fn initial_credit(&self) -> WriteCredit {
        match self.params.flow_control {
            FlowControl::SinglePacket => WriteCredit::Ready,
            FlowControl::DelayedAck { .. } => WriteCredit::Bytes(0),
        }
    }

    /// Payload of an OKAY that grants `bytes` of window, or empty in legacy mode.
    fn ack_payload(&self, bytes: u32) -> Bytes {
        match self.params.flow_control {
            FlowControl::SinglePacket => Bytes::new(),
            FlowControl::DelayedAck { .. } => Bytes::copy_from_slice(&bytes.to_le_bytes()),
        }
    }

    /// Credit carried by an incoming OKAY.
    fn okay_credit(&self, packet: &Packet) -> Result<Option<u32>> {
        match self.params.flow_control {
            FlowControl::SinglePacket if packet.payload.is_empty() => Ok(None),
            FlowControl::DelayedAck { .. } if packet.payload.len() == 4 => {
                let bytes = [
                    packet.payload[0],
                    packet.payload[1],
                    packet.payload[2],
                    packet.payload[3],
                ];
                Ok(Some(u32::from_le_bytes(bytes)))
            }
            _ => Err(ProtocolError::MalformedPacket(format!(
                "OKAY payload of {} bytes does not match flow control mode",
                packet.payload.len()
            ))
            .into()),
        }
    }

    async fn handle_packet(self: &Arc<Self>, packet: Packet) -> Result<()> {
        tracing::trace!(
            command = %packet.command,
            arg0 = packet.arg0,
            arg1 = packet.arg1,
            len = packet.payload.len(),
            "Received packet"
        );
        match packet.command {
            Command::Open => self.on_open(packet).await,
            Command::Okay => self.on_okay(packet).await,
            Command::Write => self.on_write(packet).await,
            Command::Close => self.on_close(packet).await,
            Command::Connect | Command::Auth => {
                tracing::debug!(command = %packet.command, "Ignoring handshake packet after authentication");
                Ok(())
            }
        }
    }

    async fn on_open(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let remote_id = packet.arg0;
        let service = String::from_utf8_lossy(&packet.payload)
            .trim_end_matches('\0')
            .to_string();

        let window_ok = match self.params.flow_control {
            FlowControl::SinglePacket => packet.arg1 == 0,
            FlowControl::DelayedAck { .. } => packet.arg1 != 0,
        };
        if remote_id == 0 || !window_ok {
            tracing::warn!(remote_id, arg1 = packet.arg1, service = %service, "Refusing malformed OPEN");
            return self
                .send_packet(Command::Close, 0, remote_id, Bytes::new())
                .await;
        }

        let Some(handler) = self.find_handler(&service) else {
            tracing::debug!(remote_id, service = %service, "No handler for incoming socket");
            return self
                .send_packet(Command::Close, 0, remote_id, Bytes::new())
                .await;
        };

        // Writes wait until our OKAY is on the wire.
        let blocked = match self.params.flow_control {
            FlowControl::SinglePacket => WriteCredit::Blocked,
            FlowControl::DelayedAck { .. } => WriteCredit::Bytes(0),
        };
        let registered = {
            let mut table = lock(&self.table);
            table.allocate_id().map(|local_id| {
                let shared = Arc::new(SocketShared::new(
                    local_id,
                    remote_id,
                    service.clone(),
                    false,
                    blocked,
                ));
                let (tx, rx) = mpsc::unbounded_channel();
                table.sockets.insert(
                    local_id,
                    SocketEntry {
                        shared: Arc::clone(&shared),
                        inbound: tx,
                    },
                );
                (shared, rx)
            })
        };
        let Some((shared, inbound_rx)) = registered else {
            return self
                .send_packet(Command::Close, 0, remote_id, Bytes::new())
                .await;
        };

        let socket = AdbSocket::new(Arc::clone(&shared), Arc::clone(self), inbound_rx);
        if let Err(e) = handler.accept(socket) {
            tracing::debug!(service = %service, error = %e, "Handler refused incoming socket");
            shared.mark_closed();
            lock(&self.table).sockets.remove(&shared.local_id);
            if !shared.claim_close() {
                // The dropped socket already sent its own CLSE.
                return Ok(());
            }
            return self
                .send_packet(Command::Close, 0, remote_id, Bytes::new())
                .await;
        }

        tracing::debug!(
            local_id = shared.local_id,
            remote_id,
            service = %service,
            "Accepted incoming socket"
        );
        self.send_packet(
            Command::Okay,
            shared.local_id,
            remote_id,
            self.ack_payload(self.params.delayed_ack_bytes()),
        )
        .await?;

        let credit = match self.params.flow_control {
            FlowControl::SinglePacket => WriteCredit::Ready,
            FlowControl::DelayedAck { .. } => WriteCredit::Bytes(packet.arg1),
        };
        shared.set_credit(credit);
        Ok(())
    }

    async fn on_okay(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let remote_id = packet.arg0;
        let local_id = packet.arg1;
        let credit = self.okay_credit(&packet)?;

        enum Target {
            Pending(PendingOpen),
            Live(Arc<SocketShared>),
            Closing,
            Unknown,
        }

        let target = {
            let mut table = lock(&self.table);
            if let Some(pending) = table.pending.remove(&local_id) {
                Target::Pending(pending)
            } else if let Some(entry) = table.sockets.get(&local_id) {
                Target::Live(Arc::clone(&entry.shared))
            } else if table.closing.contains(&local_id) {
                Target::Closing
            } else {
                Target::Unknown
            }
        };

        match target {
            Target::Pending(pending) => {
                if remote_id == 0 {
                    return Err(ProtocolError::MalformedPacket(
                        "OKAY with zero remote id".to_string(),
                    )
                    .into());
                }
                let mut initial = self.initial_credit();
                initial.grant(credit);

                let shared = Arc::new(SocketShared::new(
                    local_id,
                    remote_id,
                    pending.service.clone(),
                    true,
                    initial,
                ));
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&self.table).sockets.insert(
                    local_id,
                    SocketEntry {
                        shared: Arc::clone(&shared),
                        inbound: tx,
                    },
                );
                tracing::debug!(local_id, remote_id, service = %pending.service, "Socket opened");

                let socket = AdbSocket::new(shared, Arc::clone(self), rx);
                if pending.reply.send(Ok(socket)).is_err() {
                    // Dropping the returned socket sends CLOSE and parks the id
                    // in `closing` until the device confirms.
                    tracing::debug!(local_id, "Opener went away before OKAY arrived");
                }
                Ok(())
            }
            Target::Live(shared) => {
                shared.grant(credit);
                Ok(())
            }
            Target::Closing => Ok(()),
            Target::Unknown => {
                tracing::debug!(local_id, remote_id, "OKAY for unknown socket, closing");
                self.send_packet(Command::Close, local_id, remote_id, Bytes::new())
                    .await
            }
        }
    }

    async fn on_write(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let remote_id = packet.arg0;
        let local_id = packet.arg1;
        let len = packet.payload.len() as u32;

        let delivered = {
            let table = lock(&self.table);
            match table.sockets.get(&local_id) {
                Some(entry) if entry.shared.remote_id == remote_id => {
                    // Recorded first so the reader never consumes a chunk
                    // whose timestamp is not queued yet.
                    entry.shared.record_enqueued();
                    if entry.inbound.send(packet.payload).is_err() {
                        // Reader gone; nothing will consume this chunk.
                        entry.shared.forget_enqueued();
                        entry.shared.mark_closed();
                    }
                    true
                }
                _ => false,
            }
        };

        if !delivered {
            tracing::debug!(local_id, remote_id, "Dropping WRTE for unknown socket");
            return Ok(());
        }

        self.send_packet(Command::Okay, local_id, remote_id, self.ack_payload(len))
            .await
    }

    async fn on_close(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let remote_id = packet.arg0;
        let local_id = packet.arg1;

        enum Target {
            Refused(PendingOpen),
            Live(SocketEntry),
            Done,
        }

        let target = {
            let mut table = lock(&self.table);
            if remote_id == 0 && table.pending.contains_key(&local_id) {
                match table.pending.remove(&local_id) {
                    Some(pending) => Target::Refused(pending),
                    None => Target::Done,
                }
            } else if let Some(entry) = table.sockets.remove(&local_id) {
                Target::Live(entry)
            } else {
                if !table.closing.remove(&local_id) {
                    tracing::debug!(local_id, remote_id, "CLSE for unknown socket");
                }
                Target::Done
            }
        };

        match target {
            Target::Refused(pending) => {
                tracing::debug!(local_id, service = %pending.service, "Device refused OPEN");
                let _ = pending.reply.send(Err(ClientError::RemoteRefused {
                    service: pending.service,
                }));
                Ok(())
            }
            Target::Live(entry) => {
                let shared = entry.shared;
                shared.mark_closed();
                tracing::debug!(
                    local_id,
                    remote_id = shared.remote_id,
                    service = %shared.service,
                    "Device closed socket"
                );
                if shared.claim_close() {
                    self.send_packet(Command::Close, local_id, shared.remote_id, Bytes::new())
                        .await?;
                }
                Ok(())
            }
            Target::Done => Ok(()),
        }
    }

    fn find_handler(&self, service: &str) -> Option<Arc<dyn IncomingSocketHandler>> {
        let handlers = lock(&self.handlers);
        if let Some(handler) = handlers.get(service) {
            return Some(Arc::clone(handler));
        }
        handlers
            .iter()
            .filter(|(prefix, _)| prefix.ends_with(':') && service.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| Arc::clone(handler))
    }

    fn find_stalled(&self, limit: Duration) -> Option<ConnectionState> {
        let table = lock(&self.table);
        table.sockets.values().find_map(|entry| {
            let waited = entry.shared.oldest_unread()?;
            (waited >= limit).then(|| ConnectionState::Stalled {
                local_id: entry.shared.local_id,
                service: entry.shared.service.clone(),
                waited,
            })
        })
    }

    /// Ends the link: rejects pending opens, ends every socket stream and
    /// shuts the writer down. Only the first call has any effect.
    async fn teardown(&self, state: ConnectionState) {
        let (pending, sockets) = {
            let mut table = lock(&self.table);
            if table.shut_down {
                return;
            }
            table.shut_down = true;
            table.closing.clear();
            let pending: Vec<PendingOpen> = table.pending.drain().map(|(_, p)| p).collect();
            let sockets: Vec<SocketEntry> = table.sockets.drain().map(|(_, s)| s).collect();
            (pending, sockets)
        };

        let reason = state.describe();
        match &state {
            ConnectionState::Closed => tracing::debug!("Connection closed"),
            ConnectionState::Stalled { .. } => tracing::error!(reason = %reason, "Connection torn down"),
            _ => tracing::warn!(reason = %reason, "Connection lost"),
        }

        self.state.send_replace(state);
        self.shutdown.cancel();

        for open in pending {
            let _ = open
                .reply
                .send(Err(ClientError::ConnectionLost(reason.clone())));
        }
        for entry in sockets {
            entry.shared.claim_close();
            entry.shared.mark_closed();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

async fn run_reader<R>(link: Arc<Link>, mut framed: FramedRead<R, PacketCodec>)
where
    R: AsyncRead + Send + Unpin,
{
    let state = loop {
        let next = tokio::select! {
            _ = link.shutdown.cancelled() => return,
            next = framed.next() => next,
        };

        match next {
            Some(Ok(packet)) => {
                if let Err(e) = link.handle_packet(packet).await {
                    break ConnectionState::Failed(e.to_string());
                }
            }
            Some(Err(e)) => break ConnectionState::Failed(e.to_string()),
            None => break ConnectionState::Failed("device closed the connection".to_string()),
        }
    };
    link.teardown(state).await;
}

async fn run_watchdog(link: Arc<Link>, limit: Duration) {
    let period = (limit / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = link.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Some(state) = link.find_stalled(limit) {
            link.teardown(state).await;
            return;
        }
    }
}

/// Handle to a running socket multiplexer. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    link: Arc<Link>,
}

impl Dispatcher {
    /// Starts the read task (and the watchdog, if configured) over an
    /// authenticated stream.
    pub fn start<R, W>(
        framed: FramedRead<R, PacketCodec>,
        writer: W,
        params: ConnectionParams,
        options: DispatcherOptions,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Connected);
        let link = Arc::new(Link {
            params,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            table: Mutex::new(SocketTable::default()),
            handlers: Mutex::new(HashMap::new()),
            state,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_reader(Arc::clone(&link), framed));
        if let Some(limit) = options.read_time_limit {
            tokio::spawn(run_watchdog(Arc::clone(&link), limit));
        }

        Self { link }
    }

    /// Negotiated connection parameters.
    pub fn params(&self) -> &ConnectionParams {
        &self.link.params
    }

    /// Opens a socket to `service` and waits for the device to accept it.
    pub async fn open(&self, service: &str) -> Result<AdbSocket> {
        let (reply, response) = oneshot::channel();
        let local_id = {
            let mut table = lock(&self.link.table);
            if table.shut_down {
                return Err(self.link.lost());
            }
            let local_id = table.allocate_id().ok_or_else(|| {
                ClientError::ConnectionLost("no free socket ids".to_string())
            })?;
            table.pending.insert(
                local_id,
                PendingOpen {
                    service: service.to_string(),
                    reply,
                },
            );
            local_id
        };

        let mut payload = service.as_bytes().to_vec();
        if self.link.params.null_terminated_services {
            payload.push(0);
        }

        tracing::debug!(local_id, service, "Opening socket");
        let window = self.link.params.delayed_ack_bytes();
        if let Err(e) = self
            .link
            .send_packet(Command::Open, local_id, window, Bytes::from(payload))
            .await
        {
            lock(&self.link.table).pending.remove(&local_id);
            return Err(e);
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(self.link.lost()),
        }
    }

    /// Sends a single packet.
    pub async fn send_packet(&self, command: Command, arg0: u32, arg1: u32, payload: Bytes) -> Result<()> {
        self.link.send_packet(command, arg0, arg1, payload).await
    }

    /// Routes device-initiated opens for `service` to `handler`.
    ///
    /// A service ending in `:` also matches any service it prefixes.
    pub fn add_reverse_handler<H>(&self, service: impl Into<String>, handler: H)
    where
        H: IncomingSocketHandler + 'static,
    {
        lock(&self.link.handlers).insert(service.into(), Arc::new(handler));
    }

    /// Removes a handler. Returns whether one was registered.
    pub fn remove_reverse_handler(&self, service: &str) -> bool {
        lock(&self.link.handlers).remove(service).is_some()
    }

    /// Removes every handler.
    pub fn clear_reverse_handlers(&self) {
        lock(&self.link.handlers).clear();
    }

    /// Number of open sockets.
    pub fn live_sockets(&self) -> usize {
        lock(&self.link.table).sockets.len()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.link.state.borrow().clone()
    }

    /// Waits until the link is no longer connected.
    pub async fn disconnected(&self) -> ConnectionState {
        let mut rx = self.link.state.subscribe();
        let state = match rx.wait_for(|state| !state.is_connected()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    /// Closes every socket and the link. Calling it again is a no-op.
    pub async fn close(&self) {
        let live: Vec<Arc<SocketShared>> = {
            let table = lock(&self.link.table);
            if table.shut_down {
                return;
            }
            table
                .sockets
                .values()
                .map(|entry| Arc::clone(&entry.shared))
                .collect()
        };
        for shared in live {
            if shared.claim_close() {
                let _ = self
                    .link
                    .send_packet(Command::Close, shared.local_id, shared.remote_id, Bytes::new())
                    .await;
            }
        }
        self.link.teardown(ConnectionState::Closed).await;
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("live_sockets", &self.live_sockets())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_id_skips_zero_and_in_use() {
        let mut table = SocketTable {
            next_id: u32::MAX - 1,
            ..Default::default()
        };
        table.closing.insert(u32::MAX);
        table.closing.insert(1);

        assert_eq!(table.allocate_id(), Some(2));
        assert_eq!(table.allocate_id(), Some(3));
    }

    #[test]
    fn test_allocate_id_is_monotonic() {
        let mut table = SocketTable::default();
        assert_eq!(table.allocate_id(), Some(1));
        assert_eq!(table.allocate_id(), Some(2));
        assert_eq!(table.allocate_id(), Some(3));
    }

    #[test]
    fn test_state_errors() {
        assert!(ConnectionState::Connected.to_error().is_none());
        assert!(matches!(
            ConnectionState::Failed("bad magic".to_string()).to_error(),
            Some(ClientError::ConnectionLost(reason)) if reason == "bad magic"
        ));
        assert!(matches!(
            ConnectionState::Stalled {
                local_id: 4,
                service: "shell:".to_string(),
                waited: Duration::from_secs(1),
            }
            .to_error(),
            Some(ClientError::StalledSocket { local_id: 4, .. })
        ));
    }
}
