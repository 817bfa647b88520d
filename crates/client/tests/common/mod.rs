//! Scripted fake daemon shared by the integration tests.
//!
//! The client runs against one end of a `tokio::io::duplex` pipe; the test
//! drives the other end packet by packet.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use client::{Device, DeviceOptions};
use futures_util::StreamExt;
use protocol::sync::{LstatV1, StatV2, DEFAULT_FILE_MODE};
use protocol::{
    AdbPrivateKey, Command, CredentialStore, MemoryCredentialStore, Packet, PacketCodec, SyncId,
    PROTOCOL_VERSION,
};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

pub const KEY_A_PEM: &str = include_str!("../fixtures/adbkey_a.pem");
pub const KEY_B_PEM: &str = include_str!("../fixtures/adbkey_b.pem");

/// Upper bound for any single step of a scripted exchange.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Daemon window granted to client sockets in delayed-ack mode.
pub const DAEMON_WINDOW: u32 = 256 * 1024;

pub fn key_a() -> AdbPrivateKey {
    AdbPrivateKey::from_rsa(&RsaPrivateKey::from_pkcs8_pem(KEY_A_PEM).unwrap()).unwrap()
}

pub fn key_b() -> AdbPrivateKey {
    AdbPrivateKey::from_rsa(&RsaPrivateKey::from_pkcs8_pem(KEY_B_PEM).unwrap()).unwrap()
}

pub fn store(keys: Vec<AdbPrivateKey>) -> Arc<dyn CredentialStore> {
    Arc::new(MemoryCredentialStore::new(keys))
}

/// Device side of the pipe.
pub struct FakeDaemon {
    framed: FramedRead<ReadHalf<DuplexStream>, PacketCodec>,
    writer: WriteHalf<DuplexStream>,
    /// Window granted in OKAY packets, `None` in single-packet mode.
    pub window: Option<u32>,
}

impl FakeDaemon {
    pub fn new(stream: DuplexStream) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            framed: FramedRead::new(read_half, PacketCodec::handshake()),
            writer,
            window: None,
        }
    }

    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(STEP_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a packet")
            .expect("client closed the connection")
            .expect("client sent an undecodable packet")
    }

    /// Next packet, or `None` if nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Some(packet),
            _ => None,
        }
    }

    /// Next packet that is not an OKAY.
    pub async fn recv_skipping_acks(&mut self) -> Packet {
        loop {
            let packet = self.recv().await;
            if packet.command != Command::Okay {
                return packet;
            }
        }
    }

    /// Next OPEN. Skips OKAYs and the client's CLSE replies to sockets
    /// the daemon already closed.
    pub async fn recv_open(&mut self) -> Packet {
        loop {
            let packet = self.recv().await;
            match packet.command {
                Command::Okay | Command::Close => continue,
                _ => return packet,
            }
        }
    }

    /// Waits for the client to close the connection.
    pub async fn expect_eof(&mut self) {
        loop {
            match tokio::time::timeout(STEP_TIMEOUT, self.framed.next())
                .await
                .expect("timed out waiting for eof")
            {
                None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.writer
            .write_all(&packet.serialize())
            .await
            .expect("failed to write packet");
        self.writer.flush().await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub fn okay_payload(&self, bytes: u32) -> Bytes {
        match self.window {
            Some(_) => Bytes::copy_from_slice(&bytes.to_le_bytes()),
            None => Bytes::new(),
        }
    }

    /// Accepts the next OPEN, returning the client's id and the service.
    pub async fn accept_open(&mut self, daemon_id: u32) -> (u32, String) {
        let packet = self.recv_open().await;
        assert_eq!(packet.command, Command::Open, "expected OPEN, got {packet:?}");
        let service = String::from_utf8_lossy(&packet.payload)
            .trim_end_matches('\0')
            .to_string();
        let window = self.window.unwrap_or(0);
        let payload = self.okay_payload(window);
        self.send(Packet::new(Command::Okay, daemon_id, packet.arg0, payload))
            .await;
        (packet.arg0, service)
    }

    /// Refuses the next OPEN, returning the service.
    pub async fn refuse_open(&mut self) -> String {
        let packet = self.recv_open().await;
        assert_eq!(packet.command, Command::Open, "expected OPEN, got {packet:?}");
        self.send(Packet::new(Command::Close, 0, packet.arg0, Bytes::new()))
            .await;
        String::from_utf8_lossy(&packet.payload)
            .trim_end_matches('\0')
            .to_string()
    }

    pub async fn write(&mut self, daemon_id: u32, client_id: u32, data: impl Into<Bytes>) {
        self.send(Packet::new(Command::Write, daemon_id, client_id, data))
            .await;
    }

    pub async fn close(&mut self, daemon_id: u32, client_id: u32) {
        self.send(Packet::new(Command::Close, daemon_id, client_id, Bytes::new()))
            .await;
    }

    /// Acknowledges a WRTE from the client.
    pub async fn ack(&mut self, write: &Packet) {
        let payload = self.okay_payload(write.payload.len() as u32);
        self.send(Packet::new(Command::Okay, write.arg1, write.arg0, payload))
            .await;
    }

    /// Receives and acknowledges one WRTE. Returns `None` on CLSE.
    pub async fn recv_write(&mut self) -> Option<Packet> {
        let packet = self.recv_skipping_acks().await;
        match packet.command {
            Command::Write => {
                self.ack(&packet).await;
                Some(packet)
            }
            Command::Close => None,
            other => panic!("expected WRTE or CLSE, got {other}"),
        }
    }
}

/// How the fake daemon answers the handshake.
#[derive(Debug, Clone)]
pub struct DaemonSetup {
    pub version: u32,
    pub max_payload: u32,
    pub features: Vec<&'static str>,
    pub options: DeviceOptions,
}

impl Default for DaemonSetup {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            max_payload: 256 * 1024,
            features: vec!["shell_v2", "cmd", "stat_v2", "ls_v2", "sendrecv_v2", "delayed_ack"],
            options: DeviceOptions::default(),
        }
    }
}

impl DaemonSetup {
    pub fn with_features(features: &[&'static str]) -> Self {
        Self {
            features: features.to_vec(),
            ..Default::default()
        }
    }

    pub fn banner(&self) -> String {
        format!(
            "device::ro.product.name=sdk;ro.product.model=Pixel;ro.product.device=emu;features={}",
            self.features.join(",")
        )
    }
}

/// Starts [`Device::connect`] on one end of a pipe and reads the client's
/// CNXN on the other.
pub async fn start_connect(
    store: Arc<dyn CredentialStore>,
    options: DeviceOptions,
) -> (JoinHandle<client::Result<Device>>, FakeDaemon, Packet) {
    let (client_end, daemon_end) = tokio::io::duplex(1 << 20);
    let handle = tokio::spawn(Device::connect(client_end, store, options));

    let mut daemon = FakeDaemon::new(daemon_end);
    let connect = daemon.recv().await;
    assert_eq!(connect.command, Command::Connect);
    (handle, daemon, connect)
}

/// Connects a client to a fake daemon that accepts without authentication.
pub async fn connect(setup: DaemonSetup) -> (Device, FakeDaemon) {
    let (handle, mut daemon, _) = start_connect(store(vec![key_a()]), setup.options.clone()).await;
    daemon
        .send(Packet::new(
            Command::Connect,
            setup.version,
            setup.max_payload,
            setup.banner(),
        ))
        .await;

    let device = handle.await.unwrap().expect("handshake failed");
    if setup.features.contains(&"delayed_ack") && setup.options.handshake.delayed_ack_bytes > 0 {
        daemon.window = Some(DAEMON_WINDOW);
    }
    (device, daemon)
}

/// A file held by [`FakeFs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub mode: u32,
    pub mtime: u32,
    pub data: Vec<u8>,
}

impl FakeFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            mode: DEFAULT_FILE_MODE,
            mtime: 1_700_000_000,
            data: data.into(),
        }
    }
}

/// Flat file system served by [`serve_sync`]. Directory entries are the
/// files whose path starts with `dir/`.
#[derive(Debug, Clone, Default)]
pub struct FakeFs {
    pub files: BTreeMap<String, FakeFile>,
    /// Paths that fail a push as soon as the request arrives.
    pub read_only: Vec<String>,
    /// DATA size used when answering a pull.
    pub pull_chunk: usize,
    /// Last push flags seen.
    pub last_send_flags: Option<u32>,
}

impl FakeFs {
    pub fn new() -> Self {
        Self {
            pull_chunk: 4096,
            ..Default::default()
        }
    }

    fn list(&self, dir: &str) -> Vec<(String, &FakeFile)> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .iter()
            .filter_map(|(path, file)| {
                let name = path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| (name.to_string(), file))
            })
            .collect()
    }
}

/// Byte stream of one client socket, seen from the daemon.
pub struct SocketStream<'a> {
    pub daemon: &'a mut FakeDaemon,
    pub daemon_id: u32,
    pub client_id: u32,
    buffer: BytesMut,
}

impl<'a> SocketStream<'a> {
    pub fn new(daemon: &'a mut FakeDaemon, daemon_id: u32, client_id: u32) -> Self {
        Self {
            daemon,
            daemon_id,
            client_id,
            buffer: BytesMut::new(),
        }
    }

    /// Reads exactly `len` bytes; `None` if the client closed first.
    pub async fn read_exact(&mut self, len: usize) -> Option<Bytes> {
        while self.buffer.len() < len {
            let packet = self.daemon.recv_write().await?;
            self.buffer.extend_from_slice(&packet.payload);
        }
        Some(self.buffer.split_to(len).freeze())
    }

    pub async fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_exact(4).await?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub async fn send(&mut self, data: impl Into<Bytes>) {
        self.daemon.write(self.daemon_id, self.client_id, data).await;
    }
}

fn id_bytes(id: SyncId, buf: &mut BytesMut) {
    buf.put_u32_le(id.0);
}

fn fail(message: &str) -> Bytes {
    let mut buf = BytesMut::new();
    id_bytes(SyncId::FAIL, &mut buf);
    buf.put_u32_le(message.len() as u32);
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

fn stat_v2(file: Option<&FakeFile>) -> StatV2 {
    match file {
        Some(file) => StatV2 {
            error: 0,
            dev: 1,
            ino: 42,
            mode: file.mode,
            nlink: 1,
            uid: 2000,
            gid: 2000,
            size: file.data.len() as u64,
            atime: u64::from(file.mtime),
            mtime: u64::from(file.mtime),
            ctime: u64::from(file.mtime),
        },
        None => StatV2 {
            error: 2,
            ..Default::default()
        },
    }
}

/// Serves sync requests on one socket until the client closes it or sends
/// QUIT. Returns the file system afterwards.
pub async fn serve_sync(
    daemon: &mut FakeDaemon,
    daemon_id: u32,
    client_id: u32,
    mut fs: FakeFs,
) -> FakeFs {
    let mut stream = SocketStream::new(daemon, daemon_id, client_id);
    loop {
        let Some(header) = stream.read_exact(8).await else {
            return fs;
        };
        let id = SyncId(u32::from_le_bytes([header[0], header[1], header[2], header[3]]));
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        if id == SyncId::QUIT {
            stream.daemon.close(daemon_id, client_id).await;
            let _ = stream.daemon.try_recv(Duration::from_millis(200)).await;
            return fs;
        }

        let Some(arg) = stream.read_exact(len).await else {
            return fs;
        };
        let arg = String::from_utf8_lossy(&arg).into_owned();
        let mut out = BytesMut::new();

        match id {
            SyncId::STAT_V1 => {
                id_bytes(SyncId::STAT_V1, &mut out);
                let stat = fs
                    .files
                    .get(&arg)
                    .map(|f| LstatV1 {
                        mode: f.mode,
                        size: f.data.len() as u32,
                        mtime: f.mtime,
                    })
                    .unwrap_or_default();
                stat.encode(&mut out);
            }
            SyncId::LSTAT_V2 | SyncId::STAT_V2 => {
                id_bytes(id, &mut out);
                stat_v2(fs.files.get(&arg)).encode(&mut out);
            }
            SyncId::LIST | SyncId::LIST_V2 => {
                let v2 = id == SyncId::LIST_V2;
                for (name, file) in fs.list(&arg) {
                    if v2 {
                        id_bytes(SyncId::DENT_V2, &mut out);
                        stat_v2(Some(file)).encode(&mut out);
                    } else {
                        id_bytes(SyncId::DENT, &mut out);
                        LstatV1 {
                            mode: file.mode,
                            size: file.data.len() as u32,
                            mtime: file.mtime,
                        }
                        .encode(&mut out);
                    }
                    out.put_u32_le(name.len() as u32);
                    out.put_slice(name.as_bytes());
                }
                id_bytes(SyncId::DONE, &mut out);
                let fixed = if v2 { 72 } else { 16 };
                out.put_bytes(0, fixed);
            }
            SyncId::RECV => match fs.files.get(&arg) {
                Some(file) => {
                    for chunk in file.data.chunks(fs.pull_chunk.max(1)) {
                        id_bytes(SyncId::DATA, &mut out);
                        out.put_u32_le(chunk.len() as u32);
                        out.put_slice(chunk);
                    }
                    id_bytes(SyncId::DONE, &mut out);
                    out.put_u32_le(0);
                }
                None => out.put_slice(&fail("No such file or directory")),
            },
            SyncId::SEND | SyncId::SEND_V2 => {
                let (path, mode, flags) = if id == SyncId::SEND_V2 {
                    let Some(v2_header) = stream.read_exact(12).await else {
                        return fs;
                    };
                    let word = |i: usize| {
                        u32::from_le_bytes([
                            v2_header[i],
                            v2_header[i + 1],
                            v2_header[i + 2],
                            v2_header[i + 3],
                        ])
                    };
                    assert_eq!(SyncId(word(0)), SyncId::SEND_V2);
                    (arg.clone(), word(4), word(8))
                } else {
                    let (path, mode) = arg.rsplit_once(',').expect("SEND needs path,mode");
                    (path.to_string(), mode.parse().expect("decimal mode"), 0)
                };
                fs.last_send_flags = Some(flags);

                if fs.read_only.contains(&path) {
                    stream.send(fail("Read-only file system")).await;
                    stream.daemon.close(daemon_id, client_id).await;
                    return fs;
                }

                let mut data = Vec::new();
                let mtime = loop {
                    let Some(chunk_header) = stream.read_exact(8).await else {
                        return fs;
                    };
                    let chunk_id = SyncId(u32::from_le_bytes([
                        chunk_header[0],
                        chunk_header[1],
                        chunk_header[2],
                        chunk_header[3],
                    ]));
                    let value = u32::from_le_bytes([
                        chunk_header[4],
                        chunk_header[5],
                        chunk_header[6],
                        chunk_header[7],
                    ]);
                    match chunk_id {
                        SyncId::DATA => {
                            let Some(chunk) = stream.read_exact(value as usize).await else {
                                return fs;
                            };
                            data.extend_from_slice(&chunk);
                        }
                        SyncId::DONE => break value,
                        other => panic!("unexpected {other} during push"),
                    }
                };

                if flags & protocol::SendFlags::LZ4 != 0 {
                    let mut decoder = lz4_flex::frame::FrameDecoder::new(&data[..]);
                    let mut plain = Vec::new();
                    std::io::Read::read_to_end(&mut decoder, &mut plain).unwrap();
                    data = plain;
                }
                if flags & protocol::SendFlags::DRY_RUN == 0 {
                    fs.files.insert(path, FakeFile { mode, mtime, data });
                }
                id_bytes(SyncId::OKAY, &mut out);
                out.put_u32_le(0);
            }
            other => panic!("fake sync server does not handle {other}"),
        }

        stream.send(out.freeze()).await;
    }
}
