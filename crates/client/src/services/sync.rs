//! File sync client.
//!
//! One [`SyncClient`] owns one `sync:` socket. Requests are strictly
//! sequential on the wire, so every call takes the client's mutex, sends its
//! request and consumes the whole response before releasing it.
//!
//! A [`SyncPull`] keeps the mutex while it streams. The position inside the
//! transfer lives next to the socket, so a pull that is dropped or cancelled
//! mid-message still leaves the stream resumable: the next call reads and
//! discards the rest of the transfer before sending its own request.

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use protocol::sync::{
    decode_id, decode_u32, encode_numeric, encode_request, encode_send_v2_header, LstatV1, StatV2,
    DATA_FIXED_SIZE, DEFAULT_FILE_MODE, DENT_V1_FIXED_SIZE, DENT_V2_FIXED_SIZE, SYNC_DATA_MAX,
};
use protocol::{ConnectionParams, Feature, SendFlags, SyncEntry, SyncId, SyncStat};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{ClientError, Result};
use crate::transport::{AdbSocket, Dispatcher, SocketReader, SocketWriter};

/// Service name of the sync endpoint.
pub const SYNC_SERVICE: &str = "sync:";

/// Errors reported by the sync endpoint.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The device answered FAIL.
    #[error("sync failed: {0}")]
    Failed(String),

    /// The device answered with a message id that makes no sense here.
    #[error("unexpected sync response: expected {expected}, got {got}")]
    UnexpectedResponse {
        /// What the request allows.
        expected: &'static str,
        /// What arrived.
        got: SyncId,
    },

    /// A v2 stat reported an error for the path.
    #[error("stat {path} failed with errno {errno}")]
    Stat {
        /// Requested path.
        path: String,
        /// Raw errno from the device.
        errno: u32,
    },

    /// Dry-run pushes need send v2 with dry-run support.
    #[error("dry run is not supported by the device")]
    DryRunUnsupported,
}

/// Compression applied to pushed data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    /// Send data as is.
    #[default]
    None,
    /// LZ4 frame stream.
    Lz4,
}

/// Parameters for [`SyncClient::push`].
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Destination path on the device.
    pub path: String,
    /// File contents.
    pub data: Bytes,
    /// `(type << 12) | permissions`; defaults to a 0666 regular file.
    pub mode: u32,
    /// Modification time to set; defaults to now.
    pub mtime: Option<u32>,
    /// Bytes per DATA message, at most 64 KiB.
    pub packet_size: usize,
    /// Ask the device to go through the motions without writing.
    pub dry_run: bool,
    /// Compression for the data stream.
    pub compression: Compression,
}

impl PushOptions {
    /// Push `data` to `path` with default settings.
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            mode: DEFAULT_FILE_MODE,
            mtime: None,
            packet_size: SYNC_DATA_MAX,
            dry_run: false,
            compression: Compression::None,
        }
    }

    /// Sets the file mode.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the modification time.
    pub fn with_mtime(mut self, mtime: u32) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Sets the DATA message size.
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Enables or disables dry run.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets compression.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

/// Sync capabilities negotiated with the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SyncFeatures {
    stat_v2: bool,
    list_v2: bool,
    send_v2: bool,
    lz4: bool,
    dry_run: bool,
}

impl SyncFeatures {
    fn from_params(params: &ConnectionParams) -> Self {
        Self {
            stat_v2: params.can_use_feature(Feature::StatV2),
            list_v2: params.can_use_feature(Feature::ListV2),
            send_v2: params.can_use_feature(Feature::SendReceiveV2),
            lz4: params.can_use_feature(Feature::SendReceiveV2Lz4),
            dry_run: params.can_use_feature(Feature::SendReceiveV2DryRunSend),
        }
    }
}

/// Where a pull stands in the response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullPosition {
    /// Before the next 8-byte message header.
    Header,
    /// Inside a DATA payload of this many bytes.
    Data(usize),
    /// Inside the FAIL message that ends the transfer.
    Fail(usize),
}

struct SyncInner {
    reader: SocketReader,
    writer: SocketWriter,
    /// Set while a RECV response has not been fully read.
    pull: Option<PullPosition>,
}

impl SyncInner {
    async fn send(&self, request: Bytes) -> Result<()> {
        self.writer.write(&request).await
    }

    /// Next chunk of the current pull; `None` once it has ended.
    ///
    /// Every step reads one whole unit and only then advances `pull`, and
    /// [`SocketReader::read_exact`] keeps partial input buffered, so a
    /// cancelled call resumes at the same byte.
    async fn next_pull_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.pull {
                None => return Ok(None),
                Some(PullPosition::Header) => {
                    let header = self.reader.read_exact(PULL_HEADER_SIZE).await?;
                    let id = decode_id(&header[..4])?;
                    let len = decode_u32(&header[4..])? as usize;
                    self.pull = match id {
                        SyncId::DATA => Some(PullPosition::Data(len)),
                        SyncId::FAIL => Some(PullPosition::Fail(len)),
                        SyncId::DONE => None,
                        got => {
                            self.pull = None;
                            return Err(SyncError::UnexpectedResponse {
                                expected: "DATA or DONE",
                                got,
                            }
                            .into());
                        }
                    };
                }
                Some(PullPosition::Data(len)) => {
                    let data = self.reader.read_exact(len).await?;
                    self.pull = Some(PullPosition::Header);
                    return Ok(Some(data));
                }
                Some(PullPosition::Fail(len)) => {
                    let message = self.reader.read_exact(len).await?;
                    self.pull = None;
                    let message = String::from_utf8_lossy(&message).into_owned();
                    return Err(SyncError::Failed(message).into());
                }
            }
        }
    }

    /// Reads and discards the rest of an abandoned transfer.
    async fn drain(&mut self) -> Result<()> {
        tracing::debug!(position = ?self.pull, "Draining abandoned pull");
        loop {
            match self.next_pull_chunk().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(ClientError::Sync(SyncError::Failed(message))) => {
                    tracing::debug!(message = %message, "Abandoned pull ended with FAIL");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// DATA, DONE and FAIL all start with an id and a 32-bit value.
const PULL_HEADER_SIZE: usize = 4 + DATA_FIXED_SIZE;

async fn read_id(reader: &mut SocketReader) -> Result<SyncId> {
    Ok(decode_id(&reader.read_exact(4).await?)?)
}

async fn read_u32(reader: &mut SocketReader) -> Result<u32> {
    Ok(decode_u32(&reader.read_exact(4).await?)?)
}

async fn read_fail_message(reader: &mut SocketReader) -> Result<String> {
    let len = read_u32(reader).await?;
    let message = reader.read_exact(len as usize).await?;
    Ok(String::from_utf8_lossy(&message).into_owned())
}

async fn read_name(reader: &mut SocketReader, len: u32) -> Result<String> {
    let name = reader.read_exact(len as usize).await?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}

/// Waits for the push verdict: OKAY or FAIL.
async fn read_push_response(reader: &mut SocketReader) -> Result<()> {
    match read_id(reader).await? {
        SyncId::OKAY => {
            read_u32(reader).await?;
            Ok(())
        }
        SyncId::FAIL => Err(SyncError::Failed(read_fail_message(reader).await?).into()),
        got => Err(SyncError::UnexpectedResponse {
            expected: "OKAY or FAIL",
            got,
        }
        .into()),
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn lz4_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len() / 2));
    encoder.write_all(data)?;
    encoder
        .finish()
        .map_err(|e| ClientError::Io(std::io::Error::other(e)))
}

/// Client for one `sync:` socket.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Mutex<SyncInner>>,
    features: SyncFeatures,
}

impl SyncClient {
    /// Opens a sync socket on `dispatcher`.
    pub async fn open(dispatcher: &Dispatcher) -> Result<Self> {
        let socket = dispatcher.open(SYNC_SERVICE).await?;
        Ok(Self::new(socket, dispatcher.params()))
    }

    /// Wraps an already open sync socket.
    pub fn new(socket: AdbSocket, params: &ConnectionParams) -> Self {
        let (reader, writer) = socket.split();
        Self {
            inner: Arc::new(Mutex::new(SyncInner {
                reader,
                writer,
                pull: None,
            })),
            features: SyncFeatures::from_params(params),
        }
    }

    async fn lock(&self) -> Result<OwnedMutexGuard<SyncInner>> {
        let mut inner = Arc::clone(&self.inner).lock_owned().await;
        if inner.pull.is_some() {
            inner.drain().await?;
        }
        Ok(inner)
    }

    /// Metadata for `path` without following links.
    ///
    /// Without `stat_v2` a missing path is reported by the device as an
    /// all-zero v1 reply, which maps to `None`. An existing file whose
    /// mode, size and mtime are all zero is indistinguishable from that.
    pub async fn lstat(&self, path: &str) -> Result<Option<SyncStat>> {
        if self.features.stat_v2 {
            return self.stat_v2(SyncId::LSTAT_V2, path).await.map(Some);
        }

        let mut inner = self.lock().await?;
        inner.send(encode_request(SyncId::STAT_V1, path.as_bytes())).await?;
        match read_id(&mut inner.reader).await? {
            SyncId::STAT_V1 => {
                let stat = LstatV1::decode(&inner.reader.read_exact(LstatV1::SIZE).await?)?;
                if stat.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(stat.into()))
                }
            }
            got => Err(SyncError::UnexpectedResponse {
                expected: "STAT",
                got,
            }
            .into()),
        }
    }

    /// Metadata for `path`, following links. Needs `stat_v2`.
    pub async fn stat(&self, path: &str) -> Result<SyncStat> {
        if !self.features.stat_v2 {
            return Err(ClientError::UnsupportedFeature("stat_v2"));
        }
        self.stat_v2(SyncId::STAT_V2, path).await
    }

    async fn stat_v2(&self, id: SyncId, path: &str) -> Result<SyncStat> {
        let mut inner = self.lock().await?;
        inner.send(encode_request(id, path.as_bytes())).await?;
        let got = read_id(&mut inner.reader).await?;
        if got != id {
            return Err(SyncError::UnexpectedResponse {
                expected: "STA2 or LST2",
                got,
            }
            .into());
        }
        let stat = StatV2::decode(&inner.reader.read_exact(StatV2::SIZE).await?)?;
        if stat.error != 0 {
            return Err(SyncError::Stat {
                path: path.to_string(),
                errno: stat.error,
            }
            .into());
        }
        Ok(stat.into())
    }

    /// Lists the entries of a directory.
    pub async fn list(&self, path: &str) -> Result<Vec<SyncEntry>> {
        let v2 = self.features.list_v2;
        let (request, entry_id, fixed) = if v2 {
            (SyncId::LIST_V2, SyncId::DENT_V2, DENT_V2_FIXED_SIZE)
        } else {
            (SyncId::LIST, SyncId::DENT, DENT_V1_FIXED_SIZE)
        };

        let mut inner = self.lock().await?;
        inner.send(encode_request(request, path.as_bytes())).await?;

        let mut entries = Vec::new();
        loop {
            let id = read_id(&mut inner.reader).await?;
            if id == entry_id {
                let header = inner.reader.read_exact(fixed).await?;
                let (stat, name_len) = if v2 {
                    let stat = StatV2::decode(&header[..StatV2::SIZE])?;
                    if stat.error != 0 {
                        tracing::debug!(errno = stat.error, "Entry stat failed on device");
                    }
                    (SyncStat::from(stat), decode_u32(&header[StatV2::SIZE..])?)
                } else {
                    let stat = LstatV1::decode(&header[..LstatV1::SIZE])?;
                    (SyncStat::from(stat), decode_u32(&header[LstatV1::SIZE..])?)
                };
                let name = read_name(&mut inner.reader, name_len).await?;
                entries.push(SyncEntry { name, stat });
                continue;
            }
            match id {
                SyncId::DONE => {
                    inner.reader.read_exact(fixed).await?;
                    break;
                }
                SyncId::FAIL => {
                    let message = read_fail_message(&mut inner.reader).await?;
                    return Err(SyncError::Failed(message).into());
                }
                got => {
                    return Err(SyncError::UnexpectedResponse {
                        expected: if v2 { "DNT2 or DONE" } else { "DENT or DONE" },
                        got,
                    }
                    .into())
                }
            }
        }

        tracing::debug!(path, entries = entries.len(), v2, "Listed directory");
        Ok(entries)
    }

    /// Starts downloading `path`.
    ///
    /// The client stays locked until the returned stream finishes or is
    /// dropped.
    pub async fn pull(&self, path: &str) -> Result<SyncPull> {
        let mut inner = self.lock().await?;
        inner.send(encode_request(SyncId::RECV, path.as_bytes())).await?;
        inner.pull = Some(PullPosition::Header);
        tracing::debug!(path, "Pulling file");
        Ok(SyncPull { inner, received: 0 })
    }

    /// Downloads `path` into memory.
    pub async fn pull_to_vec(&self, path: &str) -> Result<Vec<u8>> {
        let mut pull = self.pull(path).await?;
        let mut out = Vec::new();
        while let Some(chunk) = pull.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Downloads `path` into `writer`, returning the number of bytes written.
    pub async fn pull_to_writer<W>(&self, path: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut pull = self.pull(path).await?;
        while let Some(chunk) = pull.next_chunk().await? {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok(pull.received())
    }

    /// Uploads a file.
    ///
    /// The verdict is read while data is still being sent, so a FAIL from
    /// the device ends the push early. Data already written is not rolled
    /// back.
    pub async fn push(&self, options: PushOptions) -> Result<()> {
        let features = self.features;
        if options.dry_run && !(features.send_v2 && features.dry_run) {
            return Err(SyncError::DryRunUnsupported.into());
        }
        if options.compression == Compression::Lz4 && !(features.send_v2 && features.lz4) {
            return Err(ClientError::UnsupportedFeature("sendrecv_v2_lz4"));
        }

        let packet_size = options.packet_size.clamp(1, SYNC_DATA_MAX);
        let mtime = options.mtime.unwrap_or_else(now_secs);
        let payload: Bytes = match options.compression {
            Compression::None => options.data.clone(),
            Compression::Lz4 => Bytes::from(lz4_compress(&options.data)?),
        };

        let mut guard = self.lock().await?;
        let SyncInner { reader, writer, .. } = &mut *guard;

        if features.send_v2 {
            let flags = SendFlags::default()
                .with(SendFlags::LZ4, options.compression == Compression::Lz4)
                .with(SendFlags::DRY_RUN, options.dry_run);
            writer
                .write(&encode_request(SyncId::SEND_V2, options.path.as_bytes()))
                .await?;
            writer
                .write(&encode_send_v2_header(options.mode, flags))
                .await?;
        } else {
            let target = format!("{},{}", options.path, options.mode);
            writer
                .write(&encode_request(SyncId::SEND, target.as_bytes()))
                .await?;
        }

        tracing::debug!(
            path = %options.path,
            size = options.data.len(),
            wire_size = payload.len(),
            v2 = features.send_v2,
            "Pushing file"
        );

        let send = async {
            for chunk in payload.chunks(packet_size) {
                writer.write(&encode_request(SyncId::DATA, chunk)).await?;
            }
            writer.write(&encode_numeric(SyncId::DONE, mtime)).await
        };
        let response = read_push_response(reader);
        tokio::pin!(send, response);

        let mut sent: Option<Result<()>> = None;
        let mut verdict: Option<Result<()>> = None;
        loop {
            tokio::select! {
                result = &mut response, if verdict.is_none() => verdict = Some(result),
                result = &mut send, if sent.is_none() => sent = Some(result),
                else => break,
            }
            match (&sent, &verdict) {
                (_, Some(Err(_))) | (Some(_), Some(_)) => break,
                _ => {}
            }
        }

        match (sent, verdict) {
            (_, Some(Err(e))) => Err(e),
            (Some(Err(e)), _) => Err(e),
            _ => Ok(()),
        }
    }

    /// Ends the sync session and closes the socket.
    pub async fn close(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if let Err(e) = inner.send(encode_numeric(SyncId::QUIT, 0)).await {
            tracing::debug!(error = %e, "Failed to send QUIT");
        }
        inner.writer.close().await
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("features", &self.features)
            .finish()
    }
}

/// A download in progress.
///
/// Dropping it early, or cancelling [`next_chunk`](Self::next_chunk), is
/// safe: the next request on the [`SyncClient`] first discards whatever is
/// left of this transfer.
pub struct SyncPull {
    inner: OwnedMutexGuard<SyncInner>,
    received: u64,
}

impl SyncPull {
    /// Next chunk of file data; `None` at the end of the file.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.inner.pull.is_none() {
            return Ok(None);
        }
        match self.inner.next_pull_chunk().await? {
            Some(data) => {
                self.received += data.len() as u64;
                Ok(Some(data))
            }
            None => {
                tracing::debug!(bytes = self.received, "Pull complete");
                Ok(None)
            }
        }
    }

    /// Bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}
