//! Decoder for the broker's framed binary websocket format.
//!
//! Layout per frame, little-endian, tightly packed:
//!
//! | offset | size | field                                 |
//! |--------|------|---------------------------------------|
//! | 0      | 8    | message id (u64)                      |
//! | 8      | 2    | reserved                              |
//! | 10     | 1    | reference-id length L (u8)            |
//! | 11     | L    | reference id (ASCII)                  |
//! | 11+L   | 1    | payload format (0 = JSON UTF-8)       |
//! | 12+L   | 4    | payload size S (u32)                  |
//! | 16+L   | S    | payload bytes                         |
//!
//! One websocket message may carry several frames back to back; decoding
//! walks the buffer until it is exhausted. Any malformed frame aborts the
//! whole message (the connection itself is unaffected).

use crate::domain::errors::GatewayError;

pub const PAYLOAD_FORMAT_JSON: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub message_id: u64,
    pub reference_id: String,
    pub payload_format: u8,
    pub payload: Vec<u8>,
}

/// Decode every frame in `buf`, in order.
pub fn decode_frames(buf: &[u8]) -> Result<Vec<StreamFrame>, GatewayError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let (frame, consumed) = decode_one(buf, offset)?;
        frames.push(frame);
        offset += consumed;
    }

    Ok(frames)
}

fn decode_one(buf: &[u8], start: usize) -> Result<(StreamFrame, usize), GatewayError> {
    let frame = &buf[start..];

    let header = take(frame, 0, 11, start, "frame header")?;
    let message_id = u64::from_le_bytes(header[0..8].try_into().expect("8-byte slice"));
    // header[8..10] is reserved
    let ref_id_len = header[10] as usize;

    let ref_id_bytes = take(frame, 11, ref_id_len, start, "reference id")?;
    if !ref_id_bytes.is_ascii() {
        return Err(GatewayError::Decode {
            offset: start + 11,
            reason: "reference id is not ASCII".to_string(),
        });
    }
    let reference_id = String::from_utf8_lossy(ref_id_bytes).into_owned();

    let meta = take(frame, 11 + ref_id_len, 5, start, "payload header")?;
    let payload_format = meta[0];
    let payload_size = u32::from_le_bytes(meta[1..5].try_into().expect("4-byte slice")) as usize;

    let payload = take(frame, 16 + ref_id_len, payload_size, start, "payload")?.to_vec();

    Ok((
        StreamFrame {
            message_id,
            reference_id,
            payload_format,
            payload,
        },
        16 + ref_id_len + payload_size,
    ))
}

fn take<'a>(
    frame: &'a [u8],
    offset: usize,
    len: usize,
    frame_start: usize,
    what: &str,
) -> Result<&'a [u8], GatewayError> {
    frame
        .get(offset..offset + len)
        .ok_or_else(|| GatewayError::Decode {
            offset: frame_start + offset,
            reason: format!("truncated {what}: need {len} bytes"),
        })
}

#[cfg(test)]
pub(crate) fn encode_frame(frame: &StreamFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + frame.reference_id.len() + frame.payload.len());
    buf.extend_from_slice(&frame.message_id.to_le_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.push(frame.reference_id.len() as u8);
    buf.extend_from_slice(frame.reference_id.as_bytes());
    buf.push(frame.payload_format);
    buf.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&frame.payload);
    buf
}
