//! Remote command execution.
//!
//! Two flavours exist:
//! - [`RawShell`]: the legacy `shell:` / `exec:` services. Output is a single
//!   byte stream and there is no exit code; the command is done when the
//!   device closes the socket.
//! - [`ShellV2`]: the multiplexed `shell,v2` service carrying separate
//!   stdout/stderr streams, stdin control and an exit code.
//!
//! [`ShellService`] picks v2 whenever the device supports it.

use bytes::{Bytes, BytesMut};
use protocol::{Feature, ShellCodec, ShellPacket, ShellStreamId};
use serde::Serialize;
use tokio_util::codec::Decoder;

use crate::error::{ClientError, Result};
use crate::transport::{AdbSocket, Dispatcher, SocketReader, SocketWriter};

/// How the remote command is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOptions {
    /// Allocate a pseudo-terminal on the device.
    pub pty: bool,
    /// `TERM` for the pseudo-terminal; only used with `pty`.
    pub term: Option<String>,
}

impl ShellOptions {
    /// Options for a command run without a terminal.
    pub fn raw() -> Self {
        Self::default()
    }

    /// Options for an interactive terminal session.
    pub fn pty(term: Option<String>) -> Self {
        Self { pty: true, term }
    }
}

/// Service string for a legacy shell.
///
/// `shell:` always allocates a terminal on the device; `exec:` never does.
pub fn raw_service(command: &str, pty: bool) -> String {
    if pty {
        format!("shell:{command}")
    } else {
        format!("exec:{command}")
    }
}

/// Service string for a shell v2 session.
pub fn v2_service(command: &str, options: &ShellOptions) -> String {
    match (options.pty, options.term.as_deref()) {
        (true, Some(term)) => format!("shell,v2,TERM={term},pty:{command}"),
        (true, None) => format!("shell,v2,pty:{command}"),
        (false, _) => format!("shell,v2,raw:{command}"),
    }
}

/// Collected result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShellOutput {
    /// Everything written to stdout.
    pub stdout: Vec<u8>,
    /// Everything written to stderr. Always empty for legacy shells.
    pub stderr: Vec<u8>,
    /// Exit code, if the device reported one.
    pub exit_code: Option<u8>,
}

impl ShellOutput {
    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Legacy shell session.
pub struct RawShell {
    reader: SocketReader,
    writer: SocketWriter,
}

impl RawShell {
    /// Wraps an open `shell:` or `exec:` socket.
    pub fn new(socket: AdbSocket) -> Self {
        let (reader, writer) = socket.split();
        Self { reader, writer }
    }

    /// Next chunk of output; `None` when the command has finished.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.reader.read().await
    }

    /// Writes to the command's input.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    /// Waits for the command to finish and returns all of its output.
    pub async fn read_to_end(&mut self) -> Bytes {
        self.reader.read_to_end().await
    }

    /// Waits for the command to finish. No exit code is available.
    pub async fn wait_output(mut self) -> ShellOutput {
        ShellOutput {
            stdout: self.reader.read_to_end().await.to_vec(),
            stderr: Vec::new(),
            exit_code: None,
        }
    }

    /// Sends Ctrl-C through the terminal.
    pub async fn sigint(&self) -> Result<()> {
        self.writer.write(&[protocol::shell::CTRL_C]).await
    }

    /// Closes the socket, which ends the command.
    pub async fn kill(&self) -> Result<()> {
        self.writer.close().await
    }

    /// A clonable handle for writing from another task.
    pub fn writer(&self) -> SocketWriter {
        self.writer.clone()
    }
}

impl std::fmt::Debug for RawShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawShell").finish_non_exhaustive()
    }
}

/// Output event from a shell v2 session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Data on stdout.
    Stdout(Bytes),
    /// Data on stderr.
    Stderr(Bytes),
    /// The command exited.
    Exit(u8),
}

/// Shell v2 session.
pub struct ShellV2 {
    reader: SocketReader,
    writer: SocketWriter,
    codec: ShellCodec,
    buffer: BytesMut,
    pty: bool,
    exit_code: Option<u8>,
}

impl ShellV2 {
    /// Wraps an open `shell,v2` socket.
    pub fn new(socket: AdbSocket, pty: bool) -> Self {
        let (reader, writer) = socket.split();
        Self {
            reader,
            writer,
            codec: ShellCodec::new(),
            buffer: BytesMut::new(),
            pty,
            exit_code: None,
        }
    }

    /// Exit code, once an Exit message has been received.
    pub fn exit_code(&self) -> Option<u8> {
        self.exit_code
    }

    /// Next output event; `None` once the socket is closed.
    pub async fn next_event(&mut self) -> Result<Option<ShellEvent>> {
        loop {
            while let Some(packet) = self.codec.decode(&mut self.buffer)? {
                match packet.id {
                    ShellStreamId::Stdout => return Ok(Some(ShellEvent::Stdout(packet.data))),
                    ShellStreamId::Stderr => return Ok(Some(ShellEvent::Stderr(packet.data))),
                    ShellStreamId::Exit => {
                        let code = packet.exit_code()?;
                        self.exit_code = Some(code);
                        return Ok(Some(ShellEvent::Exit(code)));
                    }
                    other => {
                        tracing::debug!(stream = ?other, "Ignoring host-bound shell message from device");
                    }
                }
            }

            match self.reader.read().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    if !self.buffer.is_empty() {
                        tracing::warn!(
                            leftover = self.buffer.len(),
                            "Shell socket closed mid-message"
                        );
                        self.buffer.clear();
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&self, packet: ShellPacket) -> Result<()> {
        self.writer.write(&packet.encode()).await
    }

    /// Writes to the command's stdin.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        self.send(ShellPacket::stdin(Bytes::copy_from_slice(data))).await
    }

    /// Signals end of input.
    pub async fn close_stdin(&self) -> Result<()> {
        self.send(ShellPacket::close_stdin()).await
    }

    /// Reports a terminal resize.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.send(ShellPacket::window_size(rows, cols)).await
    }

    /// Sends Ctrl-C. Only a terminal session turns it into a signal.
    pub async fn sigint(&self) -> Result<()> {
        if !self.pty {
            return Err(ClientError::UnsupportedFeature("sigint without a pty"));
        }
        self.send(ShellPacket::stdin(vec![protocol::shell::CTRL_C])).await
    }

    /// Closes the socket, which ends the command.
    pub async fn kill(&self) -> Result<()> {
        self.writer.close().await
    }

    /// Collects stdout, stderr and the exit code until the socket closes.
    pub async fn wait_output(mut self) -> Result<ShellOutput> {
        let mut output = ShellOutput::default();
        while let Some(event) = self.next_event().await? {
            match event {
                ShellEvent::Stdout(data) => output.stdout.extend_from_slice(&data),
                ShellEvent::Stderr(data) => output.stderr.extend_from_slice(&data),
                ShellEvent::Exit(code) => output.exit_code = Some(code),
            }
        }
        Ok(output)
    }
}

/// A running command of either flavour.
#[derive(Debug)]
pub enum Shell {
    /// Legacy shell.
    Raw(RawShell),
    /// Shell v2.
    V2(ShellV2),
}

impl Shell {
    /// Writes to the command's input.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        match self {
            Shell::Raw(shell) => shell.write(data).await,
            Shell::V2(shell) => shell.write_stdin(data).await,
        }
    }

    /// Sends Ctrl-C.
    pub async fn sigint(&self) -> Result<()> {
        match self {
            Shell::Raw(shell) => shell.sigint().await,
            Shell::V2(shell) => shell.sigint().await,
        }
    }

    /// Ends the command.
    pub async fn kill(&self) -> Result<()> {
        match self {
            Shell::Raw(shell) => shell.kill().await,
            Shell::V2(shell) => shell.kill().await,
        }
    }

    /// Waits for the command to finish.
    pub async fn wait_output(self) -> Result<ShellOutput> {
        match self {
            Shell::Raw(shell) => Ok(shell.wait_output().await),
            Shell::V2(shell) => shell.wait_output().await,
        }
    }
}

impl std::fmt::Debug for ShellV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellV2")
            .field("pty", &self.pty)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// Starts commands on the device.
#[derive(Debug, Clone)]
pub struct ShellService {
    dispatcher: Dispatcher,
}

impl ShellService {
    /// Creates a service over a running dispatcher.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Whether sessions will use shell v2.
    pub fn supports_v2(&self) -> bool {
        self.dispatcher.params().can_use_feature(Feature::ShellV2)
    }

    /// Starts `command`, using shell v2 when the device supports it.
    pub async fn spawn(&self, command: &str, options: &ShellOptions) -> Result<Shell> {
        if self.supports_v2() {
            self.spawn_v2(command, options).await.map(Shell::V2)
        } else {
            self.spawn_raw(command, options.pty).await.map(Shell::Raw)
        }
    }

    /// Starts `command` over the legacy service.
    pub async fn spawn_raw(&self, command: &str, pty: bool) -> Result<RawShell> {
        let socket = self.dispatcher.open(&raw_service(command, pty)).await?;
        Ok(RawShell::new(socket))
    }

    /// Starts `command` over shell v2.
    pub async fn spawn_v2(&self, command: &str, options: &ShellOptions) -> Result<ShellV2> {
        if !self.supports_v2() {
            return Err(ClientError::UnsupportedFeature("shell_v2"));
        }
        let socket = self.dispatcher.open(&v2_service(command, options)).await?;
        Ok(ShellV2::new(socket, options.pty))
    }

    /// Runs `command` without a terminal and collects its output.
    pub async fn run(&self, command: &str) -> Result<ShellOutput> {
        tracing::debug!(command, v2 = self.supports_v2(), "Running command");
        self.spawn(command, &ShellOptions::raw())
            .await?
            .wait_output()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_service_strings() {
        assert_eq!(raw_service("echo hi", true), "shell:echo hi");
        assert_eq!(raw_service("ls", false), "exec:ls");
    }

    #[test]
    fn test_v2_service_strings() {
        assert_eq!(
            v2_service("echo hi", &ShellOptions::raw()),
            "shell,v2,raw:echo hi"
        );
        assert_eq!(v2_service("", &ShellOptions::pty(None)), "shell,v2,pty:");
        assert_eq!(
            v2_service("top", &ShellOptions::pty(Some("xterm-256color".to_string()))),
            "shell,v2,TERM=xterm-256color,pty:top"
        );
    }

    #[test]
    fn test_stdout_lossy() {
        let output = ShellOutput {
            stdout: b"hi\n".to_vec(),
            ..Default::default()
        };
        assert_eq!(output.stdout_lossy(), "hi\n");
    }
}
