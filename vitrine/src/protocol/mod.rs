//! The control-plane wire protocol: newline-delimited JSON messages plus
//! the inline (fallback) pixel payload codec.
//!
//! The channel itself is stateless — every message is self-contained and
//! all session state lives in the registries on either end.

pub mod message;
pub mod pixels;

pub use message::{
    decode_line, encode_line, AckStatus, ControlMessage, ErrorReason, ProtocolError,
};
