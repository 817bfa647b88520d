//! Connection transport: handshake, socket multiplexing and logical sockets.

pub mod dispatcher;
pub mod handshake;
pub mod socket;

pub use dispatcher::{ConnectionState, Dispatcher, DispatcherOptions, IncomingSocketHandler};
pub use handshake::perform_handshake;
pub use socket::{AdbSocket, SocketReader, SocketWriter, WriteCredit};

use protocol::{Packet, PACKET_HEADER_SIZE};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writes the header, then the payload, then flushes.
pub(crate) async fn write_packet<W>(writer: &mut W, packet: &Packet) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header: [u8; PACKET_HEADER_SIZE] = packet.header().encode();
    writer.write_all(&header).await?;
    if !packet.payload.is_empty() {
        writer.write_all(&packet.payload).await?;
    }
    writer.flush().await
}
