//! Framed message format of the internal master/worker channel.
//!
//! Every message is a fixed 16-byte header of little-endian u32 fields
//! (magic, version, type, payload length) followed by a UTF-8 JSON
//! payload. The header must validate before the payload is parsed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use infergate_common::ModelFamily;

/// "OAIC"
pub const CLUSTER_MAGIC: u32 = 0x4F41_4943;
pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;

/// Worker id used by mode auto-detection. A master answers the
/// handshake without recording anything for this id.
pub const PROBE_WORKER_ID: &str = "probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Handshake = 1,
    HandshakeAck = 2,
    RegisterModel = 3,
    RegisterAck = 4,
    Heartbeat = 5,
    HeartbeatAck = 6,
    ForwardRequest = 7,
    ForwardResponse = 8,
    Error = 9,
    Disconnect = 10,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Handshake),
            2 => Some(Self::HandshakeAck),
            3 => Some(Self::RegisterModel),
            4 => Some(Self::RegisterAck),
            5 => Some(Self::Heartbeat),
            6 => Some(Self::HeartbeatAck),
            7 => Some(Self::ForwardRequest),
            8 => Some(Self::ForwardResponse),
            9 => Some(Self::Error),
            10 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame shorter than the {HEADER_LEN}-byte header")]
    TooShort,
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    BadVersion(u32),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("payload truncated: header says {expected} bytes, frame has {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid payload: {0}")]
    BadPayload(#[from] serde_json::Error),
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Build a complete frame for the given type and JSON payload.
pub fn encode_frame(ty: MessageType, payload: &Value) -> Vec<u8> {
    let body = payload.to_string();
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&CLUSTER_MAGIC.to_le_bytes());
    frame.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    frame.extend_from_slice(&(ty as u32).to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Validate the header and parse the payload.
pub fn decode_frame(bytes: &[u8]) -> Result<(MessageType, Value), FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort);
    }
    let magic = read_u32(bytes, 0);
    if magic != CLUSTER_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let version = read_u32(bytes, 4);
    if version != PROTOCOL_VERSION {
        return Err(FrameError::BadVersion(version));
    }
    let raw_type = read_u32(bytes, 8);
    let ty = MessageType::from_u32(raw_type).ok_or(FrameError::UnknownType(raw_type))?;
    let len = read_u32(bytes, 12) as usize;
    if bytes.len() < HEADER_LEN + len {
        return Err(FrameError::Truncated {
            expected: len,
            actual: bytes.len() - HEADER_LEN,
        });
    }
    let payload = if len == 0 {
        json!({})
    } else {
        serde_json::from_slice(&bytes[HEADER_LEN..HEADER_LEN + len])?
    };
    Ok((ty, payload))
}

// ---- typed payloads ----

#[derive(Debug, Clone, Deserialize)]
pub struct Handshake {
    pub worker_id: String,
    #[serde(default)]
    pub worker_host: String,
    #[serde(default)]
    pub worker_port: u16,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub accepted: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub master_host: String,
    #[serde(default)]
    pub master_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterModel {
    pub worker_id: String,
    #[serde(default)]
    pub worker_host: String,
    #[serde(default)]
    pub worker_port: u16,
    pub model_type: u32,
    pub model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    #[serde(default)]
    pub worker_host: String,
    #[serde(default)]
    pub worker_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardRequest {
    pub request_id: String,
    pub model_type: u32,
    #[serde(default)]
    pub request: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardResponse {
    pub request_id: String,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Disconnect {
    #[serde(default)]
    pub worker_id: String,
}

// ---- payload builders ----

pub fn make_handshake(worker_id: &str, worker_host: &str, worker_port: u16) -> Value {
    json!({
        "worker_id": worker_id,
        "worker_host": worker_host,
        "worker_port": worker_port,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
}

pub fn make_handshake_ack(accepted: bool, message: &str, master_host: &str, master_port: u16) -> Value {
    json!({
        "accepted": accepted,
        "message": message,
        "master_host": master_host,
        "master_port": master_port,
    })
}

pub fn make_register_model(
    worker_id: &str,
    worker_host: &str,
    worker_port: u16,
    family: ModelFamily,
    model_name: &str,
) -> Value {
    json!({
        "worker_id": worker_id,
        "worker_host": worker_host,
        "worker_port": worker_port,
        "model_type": family.as_u32(),
        "model_name": model_name,
    })
}

pub fn make_register_ack(success: bool, message: &str) -> Value {
    json!({"success": success, "message": message})
}

pub fn make_heartbeat(worker_id: &str, worker_host: &str, worker_port: u16) -> Value {
    json!({
        "worker_id": worker_id,
        "worker_host": worker_host,
        "worker_port": worker_port,
    })
}

pub fn make_heartbeat_ack() -> Value {
    json!({"pong": true})
}

pub fn make_forward_request(request_id: &str, family: ModelFamily, request: Value) -> Value {
    json!({
        "request_id": request_id,
        "model_type": family.as_u32(),
        "request": request,
    })
}

pub fn make_forward_response(request_id: &str, response: Value, is_error: bool) -> Value {
    json!({
        "request_id": request_id,
        "response": response,
        "is_error": is_error,
    })
}

pub fn make_error(code: &str, message: &str) -> Value {
    json!({"error_code": code, "error_message": message})
}

pub fn make_disconnect(worker_id: &str) -> Value {
    json!({"worker_id": worker_id})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let payload = make_handshake("w1", "10.0.0.2", 28080);
        let frame = encode_frame(MessageType::Handshake, &payload);
        assert_eq!(frame.len(), HEADER_LEN + payload.to_string().len());

        let (ty, decoded) = decode_frame(&frame).unwrap();
        assert_eq!(ty, MessageType::Handshake);
        let hs: Handshake = serde_json::from_value(decoded).unwrap();
        assert_eq!(hs.worker_id, "w1");
        assert_eq!(hs.worker_host, "10.0.0.2");
        assert_eq!(hs.worker_port, 28080);
    }

    #[test]
    fn rejects_short_frames() {
        assert!(matches!(decode_frame(&[0u8; 8]), Err(FrameError::TooShort)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = encode_frame(MessageType::Heartbeat, &make_heartbeat_ack());
        frame[0] ^= 0xff;
        assert!(matches!(decode_frame(&frame), Err(FrameError::BadMagic(_))));
    }

    #[test]
    fn rejects_bad_version() {
        let mut frame = encode_frame(MessageType::Heartbeat, &make_heartbeat_ack());
        frame[4] = 9;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::BadVersion(9))
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut frame = encode_frame(MessageType::Heartbeat, &make_heartbeat_ack());
        frame[8] = 99;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::UnknownType(99))
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let frame = encode_frame(MessageType::Heartbeat, &make_heartbeat("w", "h", 1));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 3]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_garbage_payload() {
        let mut frame = encode_frame(MessageType::Heartbeat, &json!({"worker_id": "w"}));
        let at = frame.len() - 1;
        frame[at] = b'x';
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::BadPayload(_))
        ));
    }

    #[test]
    fn header_is_little_endian() {
        let frame = encode_frame(MessageType::Handshake, &json!({}));
        assert_eq!(&frame[0..4], &CLUSTER_MAGIC.to_le_bytes());
        assert_eq!(frame[8], 1);
        assert_eq!(frame[12], 2); // "{}"
    }
}
