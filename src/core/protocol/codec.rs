// src/core/protocol/codec.rs

//! Framing and message encoding.
//!
//! The transport carries length-prefixed frames (4-byte little-endian length,
//! then the payload). A payload whose first byte is `{` is the JSON fallback;
//! a payload starting with [`BINARY_MARKER`] is the canonical MessagePack
//! encoding.

use super::{ClientMessage, ServerMessage};
use crate::core::errors::OlivineError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

/// Leading byte of a binary-encoded payload.
pub const BINARY_MARKER: u8 = 0x01;

/// Frames larger than this are treated as a protocol error.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// The encoding a session speaks. The server always replies in the format of
/// the last frame it received from that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

/// Length-prefixed frame codec. Payload interpretation is left to
/// [`decode_client_message`] / [`encode_server_message`], because the
/// coalescing writer needs access to preserialized payload bytes.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = OlivineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, OlivineError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_le_bytes(length_bytes) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(OlivineError::Protocol(format!(
                "frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
            )));
        }
        if src.len() < LENGTH_PREFIX_BYTES + length {
            src.reserve(LENGTH_PREFIX_BYTES + length - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = OlivineError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), OlivineError> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(OlivineError::Internal(format!(
                "refusing to send a {} byte frame",
                payload.len()
            )));
        }
        dst.reserve(LENGTH_PREFIX_BYTES + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

fn encode_payload<T: Serialize>(message: &T, format: WireFormat) -> Result<Bytes, OlivineError> {
    match format {
        WireFormat::Binary => {
            let body = rmp_serde::to_vec_named(message)?;
            let mut buf = BytesMut::with_capacity(body.len() + 1);
            buf.put_u8(BINARY_MARKER);
            buf.put_slice(&body);
            Ok(buf.freeze())
        }
        WireFormat::Json => Ok(Bytes::from(serde_json::to_vec(message)?)),
    }
}

/// Serializes a server message in the session's wire format.
pub fn encode_server_message(
    message: &ServerMessage,
    format: WireFormat,
) -> Result<Bytes, OlivineError> {
    encode_payload(message, format)
}

/// Serializes a client message (used by tests and the loopback transport).
pub fn encode_client_message(
    message: &ClientMessage,
    format: WireFormat,
) -> Result<Bytes, OlivineError> {
    encode_payload(message, format)
}

/// Detects the wire format of a raw payload.
pub fn detect_format(payload: &[u8]) -> Result<WireFormat, OlivineError> {
    match payload.first() {
        Some(&BINARY_MARKER) => Ok(WireFormat::Binary),
        Some(&b'{') => Ok(WireFormat::Json),
        Some(other) => Err(OlivineError::Protocol(format!(
            "unrecognized payload marker 0x{other:02x}"
        ))),
        None => Err(OlivineError::IncompleteFrame),
    }
}

/// Decodes one inbound payload into a [`ClientMessage`].
///
/// An unknown `type` discriminant is reported as
/// [`OlivineError::UnknownMessageType`] so the router can log and drop it;
/// every other malformation is a schema error answered with `ERROR{400}`.
pub fn decode_client_message(payload: &[u8]) -> Result<(ClientMessage, WireFormat), OlivineError> {
    let format = detect_format(payload)?;
    match format {
        WireFormat::Binary => {
            let message = rmp_serde::from_slice::<ClientMessage>(&payload[1..])
                .map_err(classify_decode_error)?;
            Ok((message, WireFormat::Binary))
        }
        WireFormat::Json => {
            let message = serde_json::from_slice::<ClientMessage>(payload)
                .map_err(|e| classify_json_error(&e))?;
            Ok((message, WireFormat::Json))
        }
    }
}

/// Decodes a server payload (used by tests and the loopback transport).
pub fn decode_server_message(payload: &[u8]) -> Result<ServerMessage, OlivineError> {
    match detect_format(payload)? {
        WireFormat::Binary => Ok(rmp_serde::from_slice(&payload[1..])?),
        WireFormat::Json => Ok(serde_json::from_slice(payload)?),
    }
}

fn classify_decode_error(e: rmp_serde::decode::Error) -> OlivineError {
    let text = e.to_string();
    if let Some(name) = unknown_variant_name(&text) {
        OlivineError::UnknownMessageType(name)
    } else {
        OlivineError::Protocol(format!("Binary decode error: {text}"))
    }
}

fn classify_json_error(e: &serde_json::Error) -> OlivineError {
    let text = e.to_string();
    if let Some(name) = unknown_variant_name(&text) {
        OlivineError::UnknownMessageType(name)
    } else {
        OlivineError::Protocol(format!("JSON error: {text}"))
    }
}

// serde reports unknown discriminants as `unknown variant `X``; everything
// else is a schema violation.
fn unknown_variant_name(text: &str) -> Option<String> {
    let rest = text.strip_prefix("unknown variant `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

/// Builds the `BATCH` envelope body from preserialized message payloads:
/// `<4-byte LE count><per message: 4-byte LE length, bytes>...`.
pub fn encode_batch_envelope(frames: &[Bytes]) -> (u32, Vec<u8>) {
    let total: usize = frames.iter().map(|f| f.len() + 4).sum();
    let mut data = Vec::with_capacity(4 + total);
    data.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        data.extend_from_slice(frame);
    }
    (frames.len() as u32, data)
}

/// Decodes a `BATCH` envelope body back into its message payloads.
pub fn decode_batch_envelope(data: &[u8]) -> Result<Vec<Bytes>, OlivineError> {
    if data.len() < 4 {
        return Err(OlivineError::Protocol("batch envelope too short".into()));
    }
    let count = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
    let mut frames = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        if data.len() < offset + 4 {
            return Err(OlivineError::Protocol("truncated batch envelope".into()));
        }
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if data.len() < offset + len {
            return Err(OlivineError::Protocol("truncated batch entry".into()));
        }
        frames.push(Bytes::copy_from_slice(&data[offset..offset + len]));
        offset += len;
    }
    if offset != data.len() {
        return Err(OlivineError::Protocol(
            "trailing bytes after batch envelope".into(),
        ));
    }
    Ok(frames)
}

