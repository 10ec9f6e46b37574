//! Wire framing of the peer channel.
//!
//! Every frame is a 4-byte big-endian header followed by the body:
//!
//! ```text
//! |header(4)                      |body                                     |
//! |(body_len << 4) | message_kind |sid(4)|payload_len(4)|payload|raw_len(4)|raw|
//! ```
//!
//! The body length rides in the header's upper 28 bits, so a body is capped at
//! `2^28 - 1` bytes. Raw log ranges ride in the `raw` section; every typed
//! record rides in `payload`.

use crate::record::Sid;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(crate) const MAX_BODY_LEN: usize = (1 << 28) - 1;

/// sid + payload_len + raw_len.
const BODY_FIXED_LEN: usize = 12;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum MessageKind {
    Identity,
    Vote,
    Database,
    Collect,
}

impl MessageKind {
    fn as_u8(self) -> u8 {
        match self {
            MessageKind::Identity => 0,
            MessageKind::Vote => 1,
            MessageKind::Database => 2,
            MessageKind::Collect => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Identity),
            1 => Some(MessageKind::Vote),
            2 => Some(MessageKind::Database),
            3 => Some(MessageKind::Collect),
            _ => None,
        }
    }
}

/// One decoded envelope off the peer channel.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct HaMessage {
    pub kind: MessageKind,
    /// Sid of the sender.
    pub sid: Sid,
    pub payload: Bytes,
    pub raw: Bytes,
}

impl HaMessage {
    pub(crate) fn identity(sid: Sid) -> Self {
        HaMessage {
            kind: MessageKind::Identity,
            sid,
            payload: Bytes::new(),
            raw: Bytes::new(),
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub(crate) enum FrameError {
    #[error("unknown message kind {0}")]
    BadKind(u8),
    #[error("frame body of {0} bytes exceeds the wire maximum")]
    BodyTooLarge(usize),
    #[error("frame body length {0} cannot cover the fixed body fields")]
    BodyUnderflow(usize),
    #[error("frame section lengths are inconsistent with the body length")]
    SectionMismatch,
}

pub(crate) fn encode_frame(msg: &HaMessage) -> Result<Bytes, FrameError> {
    let body_len = BODY_FIXED_LEN + msg.payload.len() + msg.raw.len();
    if body_len > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(body_len));
    }

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(((body_len as u32) << 4) | msg.kind.as_u8() as u32);
    buf.put_i32(msg.sid.into_inner());
    buf.put_i32(msg.payload.len() as i32);
    buf.put_slice(&msg.payload);
    buf.put_i32(msg.raw.len() as i32);
    buf.put_slice(&msg.raw);
    Ok(buf.freeze())
}

/// Incremental frame parser. Feed it whatever the socket produced; it yields
/// complete messages as they become available. Any error is a connection fault.
pub(crate) struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub(crate) fn new() -> Self {
        FrameDecoder { buf: BytesMut::new() }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub(crate) fn next(&mut self) -> Result<Option<HaMessage>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let header = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let kind_raw = (header & 0x0F) as u8;
        let kind = MessageKind::from_u8(kind_raw).ok_or(FrameError::BadKind(kind_raw))?;
        let body_len = (header >> 4) as usize;
        if body_len < BODY_FIXED_LEN {
            return Err(FrameError::BodyUnderflow(body_len));
        }
        if self.buf.len() < 4 + body_len {
            return Ok(None);
        }

        self.buf.advance(4);
        let mut body = self.buf.split_to(body_len).freeze();

        let sid = Sid::new(body.get_i32());
        let payload_len = body.get_i32();
        if payload_len < 0 || BODY_FIXED_LEN + payload_len as usize > body_len {
            return Err(FrameError::SectionMismatch);
        }
        let payload = body.copy_to_bytes(payload_len as usize);
        let raw_len = body.get_i32();
        if raw_len < 0 || raw_len as usize != body.remaining() {
            return Err(FrameError::SectionMismatch);
        }
        let raw = body.copy_to_bytes(raw_len as usize);

        Ok(Some(HaMessage { kind, sid, payload, raw }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: MessageKind, payload: &[u8], raw: &[u8]) -> HaMessage {
        HaMessage {
            kind,
            sid: Sid::new(42),
            payload: Bytes::copy_from_slice(payload),
            raw: Bytes::copy_from_slice(raw),
        }
    }

    #[test]
    fn one_shot_round_trip() {
        let msg = sample(MessageKind::Database, b"control-bytes", b"raw-log-range");
        let encoded = encode_frame(&msg).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);

        assert_eq!(decoder.next().unwrap(), Some(msg));
        assert_eq!(decoder.next().unwrap(), None);
    }

    #[test]
    fn byte_at_a_time_equals_one_shot() {
        let msg = sample(MessageKind::Vote, b"some vote payload", b"");
        let encoded = encode_frame(&msg).unwrap();

        let mut decoder = FrameDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            decoder.feed(std::slice::from_ref(byte));
            let decoded = decoder.next().unwrap();
            if i < encoded.len() - 1 {
                assert_eq!(decoded, None, "frame completed early at byte {}", i);
            } else {
                assert_eq!(decoded, Some(msg.clone()));
            }
        }
    }

    #[test]
    fn multiple_frames_in_one_feed() {
        let a = sample(MessageKind::Identity, b"", b"");
        let b = sample(MessageKind::Collect, b"view", b"");
        let mut wire = BytesMut::new();
        wire.put_slice(&encode_frame(&a).unwrap());
        wire.put_slice(&encode_frame(&b).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&wire);

        assert_eq!(decoder.next().unwrap(), Some(a));
        assert_eq!(decoder.next().unwrap(), Some(b));
        assert_eq!(decoder.next().unwrap(), None);
    }

    #[test]
    fn unknown_kind_is_a_fault() {
        let encoded = encode_frame(&sample(MessageKind::Vote, b"x", b"")).unwrap();
        let mut tampered = BytesMut::from(&encoded[..]);
        // Rewrite the kind nibble to an undefined value.
        tampered[3] = (tampered[3] & 0xF0) | 0x0F;

        let mut decoder = FrameDecoder::new();
        decoder.feed(&tampered);

        assert_eq!(decoder.next(), Err(FrameError::BadKind(15)));
    }

    #[test]
    fn inconsistent_section_lengths_are_a_fault() {
        let encoded = encode_frame(&sample(MessageKind::Vote, b"abcd", b"")).unwrap();
        let mut tampered = BytesMut::from(&encoded[..]);
        // Inflate payload_len past the body.
        tampered[8..12].copy_from_slice(&100i32.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&tampered);

        assert_eq!(decoder.next(), Err(FrameError::SectionMismatch));
    }

    #[test]
    fn oversized_body_is_rejected_at_encode() {
        let msg = HaMessage {
            kind: MessageKind::Database,
            sid: Sid::new(1),
            payload: Bytes::new(),
            // One byte past the 28-bit limit.
            raw: Bytes::from(vec![0u8; MAX_BODY_LEN - BODY_FIXED_LEN + 1]),
        };

        assert_eq!(
            encode_frame(&msg),
            Err(FrameError::BodyTooLarge(MAX_BODY_LEN + 1))
        );
    }

    #[test]
    fn empty_payload_and_raw_round_trip() {
        let msg = HaMessage::identity(Sid::new(7));
        let encoded = encode_frame(&msg).unwrap();
        assert_eq!(encoded.len(), 4 + 12);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);

        assert_eq!(decoder.next().unwrap(), Some(msg));
    }
}
