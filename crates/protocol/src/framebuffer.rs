//! Framebuffer capture header.
//!
//! The `framebuffer:` service replies with a u32 version, a header whose
//! layout depends on the version, then `size` bytes of raw pixels.
//!
//! ```text
//! v1: bpp size width height r_off r_len b_off b_len g_off g_len a_off a_len
//! v2: bpp color_space size width height ... (as v1)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Header fields of a v1 capture, excluding the version.
const V1_FIELDS: usize = 12;

/// Pixel layout of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FramebufferHeader {
    /// Header version, 1 or 2.
    pub version: u32,
    /// Bits per pixel.
    pub bpp: u32,
    /// Color space (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_space: Option<u32>,
    /// Pixel data size in bytes.
    pub size: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Red channel bit offset.
    pub red_offset: u32,
    /// Red channel bit length.
    pub red_length: u32,
    /// Blue channel bit offset.
    pub blue_offset: u32,
    /// Blue channel bit length.
    pub blue_length: u32,
    /// Green channel bit offset.
    pub green_offset: u32,
    /// Green channel bit length.
    pub green_length: u32,
    /// Alpha channel bit offset.
    pub alpha_offset: u32,
    /// Alpha channel bit length.
    pub alpha_length: u32,
}

impl FramebufferHeader {
    /// Size of the header body that follows the version word.
    pub fn body_size(version: u32) -> Result<usize> {
        match version {
            1 => Ok(V1_FIELDS * 4),
            2 => Ok((V1_FIELDS + 1) * 4),
            other => Err(ProtocolError::UnsupportedFramebufferVersion(other)),
        }
    }

    /// Parses the header body for `version`.
    pub fn decode(version: u32, data: &[u8]) -> Result<Self> {
        let expected = Self::body_size(version)?;
        if data.len() != expected {
            return Err(ProtocolError::MalformedPacket(format!(
                "framebuffer v{version} header must be {expected} bytes, got {}",
                data.len()
            )));
        }

        let mut buf = data;
        let bpp = buf.get_u32_le();
        let color_space = (version == 2).then(|| buf.get_u32_le());
        Ok(Self {
            version,
            bpp,
            color_space,
            size: buf.get_u32_le(),
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            red_offset: buf.get_u32_le(),
            red_length: buf.get_u32_le(),
            blue_offset: buf.get_u32_le(),
            blue_length: buf.get_u32_le(),
            green_offset: buf.get_u32_le(),
            green_length: buf.get_u32_le(),
            alpha_offset: buf.get_u32_le(),
            alpha_length: buf.get_u32_le(),
        })
    }

    /// Encodes version and body.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.version);
        dst.put_u32_le(self.bpp);
        if self.version == 2 {
            dst.put_u32_le(self.color_space.unwrap_or_default());
        }
        for field in [
            self.size,
            self.width,
            self.height,
            self.red_offset,
            self.red_length,
            self.blue_offset,
            self.blue_length,
            self.green_offset,
            self.green_length,
            self.alpha_offset,
            self.alpha_length,
        ] {
            dst.put_u32_le(field);
        }
    }
}
