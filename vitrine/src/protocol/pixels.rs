//! Inline frame payload codec for the fallback data path.
//!
//! Frames travel as base64 BGRA inside `frameReady` lines. Some JSON
//! encoders escape the base64 alphabet's `/` as `\/`, which is valid JSON
//! but poison to a base64 decoder — decoding therefore unescapes first,
//! then decodes, then verifies the byte length is exactly
//! `width * height * 4`. A mismatch means a corrupt or truncated message
//! and the frame is rejected whole; a partial frame is never surfaced.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::ipc::ring::BYTES_PER_PIXEL;

/// Rejection reasons for an inline frame payload.
#[derive(Debug, Error)]
pub enum PixelDecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded frame is {actual} bytes, {width}x{height} requires {expected}")]
    LengthMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Encodes a BGRA buffer for embedding in a `frameReady` message.
#[must_use]
pub fn encode(pixels: &[u8]) -> String {
    STANDARD.encode(pixels)
}

/// Decodes a `frameReady` payload, rejecting anything that is not exactly
/// one `width` × `height` BGRA frame.
pub fn decode(data: &str, width: u32, height: u32) -> Result<Vec<u8>, PixelDecodeError> {
    let unescaped = unescape_solidus(data);
    let pixels = STANDARD.decode(unescaped.as_bytes())?;

    let expected = width as usize * height as usize * BYTES_PER_PIXEL as usize;
    if pixels.len() != expected {
        return Err(PixelDecodeError::LengthMismatch {
            width,
            height,
            expected,
            actual: pixels.len(),
        });
    }
    Ok(pixels)
}

/// Reverses JSON's optional `\/` escape. Borrows when no escape is
/// present, which is the overwhelmingly common case.
fn unescape_solidus(data: &str) -> Cow<'_, str> {
    if data.contains("\\/") {
        Cow::Owned(data.replace("\\/", "/"))
    } else {
        Cow::Borrowed(data)
    }
}
