//! Message framing for terminals and cranes
//!
//! Crane wire format: `terminal_id: u32 BE | payload_len: varint | payload`.
//! Terminal payloads are sequences of
//! `op_id: u32 BE | msg_type: u8 | body_len: varint | body`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::varint;

/// Maximum crane frame payload (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Terminal ID of the crane controller
pub const CONTROLLER_TERMINAL_ID: u32 = 0;
/// Reserved terminal ID used for padding frames
pub const PADDING_TERMINAL_ID: u32 = 1;
/// Reserved terminal ID used for the session handshake
pub const HANDSHAKE_TERMINAL_ID: u32 = 2;
/// First terminal ID available for data terminals
pub const FIRST_DATA_TERMINAL_ID: u32 = 4;

/// Op ID that scopes a message to the whole terminal
pub const TERMINAL_SCOPE_OP_ID: u32 = 0;

/// Terminal message types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Start a new operation
    Init = 1,
    /// Operation data
    Data = 2,
    /// End an operation
    End = 3,
    /// End the whole terminal
    TerminalEnd = 4,
    /// Flow-control credit delta (varint body)
    SpaceReport = 5,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::Data),
            3 => Ok(Self::End),
            4 => Ok(Self::TerminalEnd),
            5 => Ok(Self::SpaceReport),
            other => Err(Error::MalformedData(format!("unknown msg type: {other}"))),
        }
    }
}

/// One message within a terminal payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalMsg {
    /// Operation the message is addressed to, 0 for the terminal itself
    pub op_id: u32,
    /// Message type
    pub msg_type: MsgType,
    /// Message body
    pub body: Vec<u8>,
}

impl TerminalMsg {
    /// Create a new message
    pub fn new(op_id: u32, msg_type: MsgType, body: Vec<u8>) -> Self {
        Self { op_id, msg_type, body }
    }

    /// Create a space report carrying a credit delta
    pub fn space_report(op_id: u32, credits: u32) -> Self {
        let mut body = BytesMut::with_capacity(varint::encoded_len(u64::from(credits)));
        varint::encode(u64::from(credits), &mut body);
        Self::new(op_id, MsgType::SpaceReport, body.to_vec())
    }

    /// Decode the credit delta of a space report body.
    pub fn credits(&self) -> Result<u32> {
        let (value, used) = varint::decode(&self.body)?
            .ok_or_else(|| Error::MalformedData("truncated space report".to_string()))?;
        if used != self.body.len() {
            return Err(Error::MalformedData("trailing bytes in space report".to_string()));
        }
        u32::try_from(value)
            .map_err(|_| Error::MalformedData("space report credit exceeds u32".to_string()))
    }

    /// Append the encoding of this message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.op_id);
        dst.put_u8(self.msg_type as u8);
        varint::encode(self.body.len() as u64, dst);
        dst.put_slice(&self.body);
    }

    /// Encode a sequence of messages into one terminal payload.
    pub fn encode_sequence(msgs: &[TerminalMsg]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for msg in msgs {
            msg.encode(&mut buf);
        }
        buf.to_vec()
    }

    /// Parse a full terminal payload into its message sequence.
    ///
    /// The payload must be fully consumed; trailing garbage is malformed.
    pub fn parse_sequence(mut src: &[u8]) -> Result<Vec<TerminalMsg>> {
        let mut msgs = Vec::new();
        while !src.is_empty() {
            if src.len() < 5 {
                return Err(Error::MalformedData("truncated terminal message header".to_string()));
            }
            let op_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            let msg_type = MsgType::try_from(src[4])?;
            src = &src[5..];

            let (body_len, used) = varint::decode(src)?
                .ok_or_else(|| Error::MalformedData("truncated body length".to_string()))?;
            src = &src[used..];
            let body_len = body_len as usize;
            if src.len() < body_len {
                return Err(Error::MalformedData("truncated message body".to_string()));
            }
            msgs.push(TerminalMsg::new(op_id, msg_type, src[..body_len].to_vec()));
            src = &src[body_len..];
        }
        Ok(msgs)
    }
}

/// A frame on the crane wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CraneFrame {
    /// Destination terminal
    pub terminal_id: u32,
    /// Opaque terminal payload
    pub payload: Vec<u8>,
}

impl CraneFrame {
    /// Create a new frame
    pub fn new(terminal_id: u32, payload: Vec<u8>) -> Self {
        Self { terminal_id, payload }
    }

    /// Encoded size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        4 + varint::encoded_len(self.payload.len() as u64) + self.payload.len()
    }

    /// Build a padding frame that occupies exactly `target` wire bytes.
    ///
    /// Padding frames are addressed to [`PADDING_TERMINAL_ID`] and dropped
    /// by the unloader. Returns `None` when `target` is too small to hold a
    /// frame header (5 bytes).
    pub fn padding(target: usize) -> Option<Self> {
        for header in 5..=4 + varint::MAX_LEN {
            let payload_len = target.checked_sub(header)?;
            if 4 + varint::encoded_len(payload_len as u64) == header {
                return Some(Self::new(PADDING_TERMINAL_ID, vec![0; payload_len]));
            }
        }
        None
    }

    /// Whether this frame is padding.
    pub fn is_padding(&self) -> bool {
        (PADDING_TERMINAL_ID..FIRST_DATA_TERMINAL_ID).contains(&self.terminal_id)
            && self.terminal_id != HANDSHAKE_TERMINAL_ID
    }
}

/// Codec for crane frames
#[derive(Debug, Default)]
pub struct CraneFrameCodec;

impl Decoder for CraneFrameCodec {
    type Item = CraneFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<CraneFrame>> {
        if src.len() < 5 {
            return Ok(None);
        }

        let terminal_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let Some((payload_len, varint_len)) = varint::decode(&src[4..])? else {
            return Ok(None);
        };
        let payload_len = payload_len as usize;
        if payload_len > MAX_FRAME_SIZE {
            return Err(Error::MalformedData(format!("frame too large: {payload_len} bytes")));
        }

        let header_len = 4 + varint_len;
        if src.len() < header_len + payload_len {
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(payload_len).to_vec();
        Ok(Some(CraneFrame { terminal_id, payload }))
    }
}

impl Encoder<CraneFrame> for CraneFrameCodec {
    type Error = Error;

    fn encode(&mut self, item: CraneFrame, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > MAX_FRAME_SIZE {
            return Err(Error::MalformedData(format!(
                "frame too large: {} bytes",
                item.payload.len()
            )));
        }
        dst.reserve(item.encoded_len());
        dst.put_u32(item.terminal_id);
        varint::encode(item.payload.len() as u64, dst);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
