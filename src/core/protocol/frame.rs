//! Data channel: binary frame encoding/decoding.
//!
//! All messages on the data channel use this compact binary envelope:
//!
//!   [1 byte: frame_type] [N bytes: payload]
//!
//! Frame types:
//!   0x01 = Control (JSON-encoded ControlMessage)
//!   0x02 = Chunk   (4 bytes index BE + raw data)
//!
//! Reliable, ordered delivery is guaranteed by the SCTP layer underneath,
//! so there are no application-level acknowledgements per chunk.

use anyhow::{Result, anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ControlMessage;

/// Frame type marker for control messages (JSON-encoded ControlMessage).
pub const FRAME_CONTROL: u8 = 0x01;

/// Frame type marker for binary chunk data.
pub const FRAME_CHUNK: u8 = 0x02;

/// Header bytes in front of a chunk payload.
pub const CHUNK_HEADER_LEN: usize = 1 + 4;

/// A decoded data channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Chunk { index: u32, data: Bytes },
}

/// Encode a control frame: [0x01][json bytes]
pub fn encode_control_frame(msg: &ControlMessage) -> Result<Bytes> {
    let json = serde_json::to_vec(msg)?;
    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Encode a chunk frame: [0x02][4 bytes index BE][payload]
pub fn encode_chunk_frame(index: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
    buf.put_u8(FRAME_CHUNK);
    buf.put_u32(index);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Decode one data channel message.
///
/// The chunk payload is a zero-copy slice of `raw`.
pub fn decode_frame(raw: Bytes) -> Result<Frame> {
    let Some(&frame_type) = raw.first() else {
        bail!("empty frame");
    };
    match frame_type {
        FRAME_CONTROL => {
            let msg = serde_json::from_slice(&raw[1..])
                .map_err(|e| anyhow!("malformed control frame: {e}"))?;
            Ok(Frame::Control(msg))
        }
        FRAME_CHUNK => {
            if raw.len() < CHUNK_HEADER_LEN {
                bail!("chunk frame too short ({} bytes)", raw.len());
            }
            let mut header = &raw[1..CHUNK_HEADER_LEN];
            let index = header.get_u32();
            Ok(Frame::Chunk {
                index,
                data: raw.slice(CHUNK_HEADER_LEN..),
            })
        }
        other => bail!("unknown frame type 0x{other:02x}"),
    }
}
