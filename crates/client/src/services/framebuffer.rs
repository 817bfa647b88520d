//! Screen capture over the `framebuffer:` service.

use bytes::Bytes;
use protocol::sync::decode_u32;
use protocol::FramebufferHeader;

use crate::error::{ClientError, Result};
use crate::transport::Dispatcher;

/// Service name of the capture endpoint.
pub const FRAMEBUFFER_SERVICE: &str = "framebuffer:";

/// A captured screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    /// Pixel layout.
    pub header: FramebufferHeader,
    /// Raw pixels, `header.size` bytes.
    pub data: Bytes,
}

/// Captures the screen.
///
/// A device that refuses the capture (for example because a secure window
/// is shown) closes the socket without sending a version.
pub async fn capture(dispatcher: &Dispatcher) -> Result<Framebuffer> {
    let mut socket = dispatcher.open(FRAMEBUFFER_SERVICE).await?;

    let version = match socket.read_exact(4).await {
        Ok(bytes) => decode_u32(&bytes)?,
        Err(ClientError::SocketClosed) => return Err(ClientError::FramebufferForbidden),
        Err(e) => return Err(e),
    };

    let body_size = FramebufferHeader::body_size(version)?;
    let header = FramebufferHeader::decode(version, &socket.read_exact(body_size).await?)?;
    let data = socket.read_exact(header.size as usize).await?;
    socket.close().await?;

    tracing::debug!(
        version,
        width = header.width,
        height = header.height,
        bpp = header.bpp,
        "Captured framebuffer"
    );
    Ok(Framebuffer { header, data })
}
