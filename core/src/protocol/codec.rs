//! Wire codec
//!
//! Every packet travels as a self-describing frame:
//!
//! ```text
//! Frame    => Length Type ChannelId Body
//! Length   => u32   (bytes following the length field)
//! Type     => u8    (stable packet type code)
//! ChannelId=> u64   (logical session/consumer channel, not the connection)
//! Body     => type-specific positional fields
//! ```
//!
//! All integers are big-endian. Strings carry a u32 byte-length prefix
//! followed by UTF-8; nullable strings are preceded by a presence flag;
//! byte arrays carry a u32 length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

use super::packet::{Packet, PacketBody, PacketType};

/// Size of the length prefix
pub const FRAME_LENGTH_SIZE: usize = 4;
/// Size of type + channel id
pub const FRAME_HEADER_SIZE: usize = 1 + 8;
/// Default upper bound on a single frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Buffer underrun: needed {needed}, available {available}")]
    BufferUnderrun { needed: usize, available: usize },
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),
    #[error("Packet type {0} is reserved and not supported")]
    ReservedPacketType(u8),
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Length prefix {declared} does not match frame size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),
}

impl CodecError {
    /// The frame itself is intact; only its packet type is not understood
    pub fn is_unsupported_type(&self) -> bool {
        matches!(
            self,
            CodecError::UnknownPacketType(_) | CodecError::ReservedPacketType(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encode a packet into a complete frame, length prefix included.
///
/// The buffer is pre-sized from [`Packet::required_buffer_size`]; `BytesMut`
/// grows if the hint was too small, and the miss is logged.
pub fn encode_packet(packet: &Packet) -> Bytes {
    let required = packet.required_buffer_size();
    let mut buf = BytesMut::with_capacity(required);

    buf.put_u32(0);
    buf.put_u8(packet.packet_type() as u8);
    buf.put_u64(packet.channel_id);
    packet.body.encode_body(&mut buf);

    if buf.len() > required {
        warn!(
            packet_type = ?packet.packet_type(),
            required,
            actual = buf.len(),
            "Required buffer size underestimated encoded packet"
        );
    }

    let length = (buf.len() - FRAME_LENGTH_SIZE) as u32;
    buf[..FRAME_LENGTH_SIZE].copy_from_slice(&length.to_be_bytes());
    buf.freeze()
}

/// Decode a frame whose length prefix has already been stripped by the
/// transport framing layer.
pub fn decode_frame(mut frame: Bytes) -> Result<Packet> {
    ensure(&frame, FRAME_HEADER_SIZE)?;
    let type_code = frame.get_u8();
    let packet_type = PacketType::try_from(type_code)?;
    let channel_id = frame.get_u64();
    let body = PacketBody::decode_body(packet_type, &mut frame)?;

    if frame.has_remaining() {
        return Err(CodecError::TrailingBytes(frame.remaining()));
    }

    Ok(Packet { channel_id, body })
}

/// Channel id of a frame without decoding its body
pub fn frame_channel_id(frame: &[u8]) -> Option<u64> {
    let raw = frame.get(1..FRAME_HEADER_SIZE)?;
    Some(u64::from_be_bytes(raw.try_into().ok()?))
}

/// Decode a complete frame including its length prefix.
pub fn decode_packet(mut data: Bytes) -> Result<Packet> {
    ensure(&data, FRAME_LENGTH_SIZE)?;
    let declared = data.get_u32() as usize;
    if declared != data.remaining() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: data.remaining(),
        });
    }
    decode_frame(data)
}

pub(crate) fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CodecError::BufferUnderrun {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_bool(buf: &mut Bytes) -> Result<bool> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidFormat(format!(
            "invalid boolean byte {other}"
        ))),
    }
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_f64(buf: &mut Bytes) -> Result<f64> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

pub(crate) fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

pub(crate) fn get_nullable_string(buf: &mut Bytes) -> Result<Option<String>> {
    if get_bool(buf)? {
        Ok(Some(get_string(buf)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub(crate) fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub(crate) fn put_nullable_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(s) => {
            put_bool(buf, true);
            put_string(buf, s);
        }
        None => put_bool(buf, false),
    }
}

pub(crate) fn string_size(value: &str) -> usize {
    4 + value.len()
}

pub(crate) fn nullable_string_size(value: Option<&str>) -> usize {
    1 + value.map_or(0, string_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_helpers() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "queue.orders");
        put_nullable_string(&mut buf, None);
        put_nullable_string(&mut buf, Some("color = 'red'"));
        assert_eq!(
            buf.len(),
            string_size("queue.orders")
                + nullable_string_size(None)
                + nullable_string_size(Some("color = 'red'"))
        );

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "queue.orders");
        assert_eq!(get_nullable_string(&mut bytes).unwrap(), None);
        assert_eq!(
            get_nullable_string(&mut bytes).unwrap().as_deref(),
            Some("color = 'red'")
        );
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_underrun_is_reported_not_panicking() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 9, b'a']);
        let err = get_string(&mut bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::BufferUnderrun {
                needed: 9,
                available: 1
            }
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &[0xff, 0xfe]);
        let mut bytes = buf.freeze();
        assert!(matches!(get_string(&mut bytes), Err(CodecError::InvalidUtf8)));
    }

    #[test]
    fn test_invalid_boolean() {
        let mut bytes = Bytes::from_static(&[7]);
        assert!(matches!(
            get_bool(&mut bytes),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_length_mismatch_detected() {
        let packet = Packet::new(3, PacketBody::SessStart);
        let encoded = encode_packet(&packet);
        let mut corrupted = BytesMut::from(&encoded[..]);
        corrupted[3] = corrupted[3].wrapping_add(1);
        assert!(matches!(
            decode_packet(corrupted.freeze()),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_and_reserved_types() {
        let mut frame = BytesMut::new();
        frame.put_u8(200);
        frame.put_u64(1);
        assert!(matches!(
            decode_frame(frame.freeze()),
            Err(CodecError::UnknownPacketType(200))
        ));

        let mut frame = BytesMut::new();
        frame.put_u8(94);
        frame.put_u64(1);
        let frame = frame.freeze();
        assert_eq!(frame_channel_id(&frame), Some(1));
        let error = decode_frame(frame).unwrap_err();
        assert!(matches!(error, CodecError::ReservedPacketType(94)));
        assert!(error.is_unsupported_type());
        assert!(!CodecError::TrailingBytes(1).is_unsupported_type());
        assert_eq!(frame_channel_id(&[76, 0, 0]), None);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let packet = Packet::new(9, PacketBody::SessCommit);
        let encoded = encode_packet(&packet);
        let mut frame = BytesMut::from(&encoded[FRAME_LENGTH_SIZE..]);
        frame.put_u8(0);
        assert!(matches!(
            decode_frame(frame.freeze()),
            Err(CodecError::TrailingBytes(1))
        ));
    }
}
