//! Control message model and the line codec.
//!
//! One JSON object per line. The `type` field tags a closed union; decoding
//! classifies failures precisely so the service can answer `missing_id`
//! for a command that lacks its session reference, skip unknown types
//! non-fatally, and drop malformed lines — never crash on peer input.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Acknowledgement status carried by `handshake_ack` and the `browser*`
/// reply messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Failed,
}

/// Closed set of failure reasons carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Unauthorized,
    MissingId,
    UnknownId,
    TooManyConnections,
    Unsupported,
    Internal,
}

/// A single control-plane message, either direction.
///
/// `token` is optional on every request: it must be present and correct on
/// all of them once the receiving end has a secret configured, and is
/// ignored otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Opens an authenticated exchange on a fresh connection.
    #[serde(rename = "handshake")]
    Handshake {
        client: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "handshake_ack")]
    HandshakeAck { status: AckStatus },

    /// Liveness probe; answered with `pong`.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong,

    /// Creates a rendering session.
    #[serde(rename = "initBrowser")]
    InitBrowser {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "browserReady")]
    BrowserReady { id: String, status: AckStatus },

    /// Mutates an existing session in place (same identity, new URL or
    /// size) — used instead of dispose+create to avoid flicker and
    /// duplicate-id races.
    #[serde(rename = "updateBrowser")]
    UpdateBrowser {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "browserUpdated")]
    BrowserUpdated { id: String, status: AckStatus },

    #[serde(rename = "disposeBrowser")]
    DisposeBrowser {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "browserDisposed")]
    BrowserDisposed { id: String, status: AckStatus },

    /// Inline frame delivery — the fallback data path used only when the
    /// shared segment could not be established. `data` is base64 BGRA.
    #[serde(rename = "frameReady")]
    FrameReady {
        id: String,
        width: u32,
        height: u32,
        data: String,
    },

    /// Any failure, with its closed reason.
    #[serde(rename = "error")]
    Error { message: ErrorReason },
}

impl ControlMessage {
    /// The authentication token a request carries, if any. Reply and event
    /// messages carry none.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Handshake { token, .. }
            | Self::Ping { token }
            | Self::InitBrowser { token, .. }
            | Self::UpdateBrowser { token, .. }
            | Self::DisposeBrowser { token, .. } => token.as_deref(),
            _ => None,
        }
    }

    /// The session id this message references, for session-scoped types.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::InitBrowser { id, .. }
            | Self::BrowserReady { id, .. }
            | Self::UpdateBrowser { id, .. }
            | Self::BrowserUpdated { id, .. }
            | Self::DisposeBrowser { id, .. }
            | Self::BrowserDisposed { id, .. }
            | Self::FrameReady { id, .. } => Some(id),
            _ => None,
        }
    }

    /// The wire name of this message's type.
    #[must_use]
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::Ping { .. } => "ping",
            Self::Pong => "pong",
            Self::InitBrowser { .. } => "initBrowser",
            Self::BrowserReady { .. } => "browserReady",
            Self::UpdateBrowser { .. } => "updateBrowser",
            Self::BrowserUpdated { .. } => "browserUpdated",
            Self::DisposeBrowser { .. } => "disposeBrowser",
            Self::BrowserDisposed { .. } => "browserDisposed",
            Self::FrameReady { .. } => "frameReady",
            Self::Error { .. } => "error",
        }
    }
}

/// Wire types that must reference a session.
const SESSION_SCOPED: &[&str] = &[
    "initBrowser",
    "browserReady",
    "updateBrowser",
    "browserUpdated",
    "disposeBrowser",
    "browserDisposed",
    "frameReady",
];

const KNOWN_TYPES: &[&str] = &[
    "handshake",
    "handshake_ack",
    "ping",
    "pong",
    "initBrowser",
    "browserReady",
    "updateBrowser",
    "browserUpdated",
    "disposeBrowser",
    "browserDisposed",
    "frameReady",
    "error",
];

/// Decode failures, classified so the receiver can respond per the
/// protocol instead of dropping the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not a JSON object, or a shape serde cannot reconcile.
    #[error("malformed control line: {0}")]
    Malformed(String),
    /// Well-formed JSON whose `type` is not in the protocol. Receivers
    /// log and ignore these.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    /// A session-scoped command without its `id`.
    #[error("message type `{0}` requires an `id` field")]
    MissingId(String),
    /// Any other required field absent or of the wrong shape.
    #[error("message type `{ty}` missing required field `{field}`")]
    MissingField { ty: String, field: &'static str },
    /// Serialization failure on the send path.
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encodes a message as one JSON line, trailing newline included.
pub fn encode_line(msg: &ControlMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line (without its newline) into a [`ControlMessage`].
///
/// # Errors
///
/// Returns the classified [`ProtocolError`] for anything that is not a
/// valid message; never panics on peer input.
pub fn decode_line(line: &str) -> Result<ControlMessage, ProtocolError> {
    match serde_json::from_str::<ControlMessage>(line) {
        Ok(msg) => Ok(msg),
        Err(err) => Err(classify_failure(line, &err)),
    }
}

/// Turns a serde failure into the precise protocol error the receiver
/// should answer with.
fn classify_failure(line: &str, err: &serde_json::Error) -> ProtocolError {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return ProtocolError::Malformed(err.to_string());
    };
    let Some(ty) = value.get("type").and_then(|t| t.as_str()) else {
        return ProtocolError::Malformed("object has no string `type` field".to_owned());
    };
    if !KNOWN_TYPES.contains(&ty) {
        return ProtocolError::UnknownType(ty.to_owned());
    }
    if SESSION_SCOPED.contains(&ty) && !value.get("id").map_or(false, serde_json::Value::is_string)
    {
        return ProtocolError::MissingId(ty.to_owned());
    }
    // A known type with its id present but some other required field
    // broken; name the first one missing for the common shapes.
    let field = match ty {
        "handshake" => "client",
        "handshake_ack" | "browserReady" | "browserUpdated" | "browserDisposed" => "status",
        "frameReady" => {
            if value.get("width").map_or(true, |v| !v.is_u64()) {
                "width"
            } else if value.get("height").map_or(true, |v| !v.is_u64()) {
                "height"
            } else {
                "data"
            }
        }
        "error" => "message",
        _ => return ProtocolError::Malformed(err.to_string()),
    };
    ProtocolError::MissingField {
        ty: ty.to_owned(),
        field,
    }
}
