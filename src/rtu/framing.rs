//! RTU frame encoding and stream deframing.
//!
//! Requests are encoded as `address + PDU + CRC`. Responses arrive as an
//! unframed byte stream from the gateway; [`FrameCodec::parse`] splits one
//! complete frame off the front of the receive buffer at a time.
//!
//! The length rules are those of a master reading replies:
//!
//! | Function code | Reply length |
//! |---|---|
//! | any with bit 0x80 set (exception) | 5 |
//! | 0x01-0x04, 0x0C, 0x11, 0x14, 0x15, 0x17 | 3 + byte count + 2 |
//! | 0x05, 0x06, 0x08, 0x0B, 0x0F, 0x10 | 8 |
//! | 0x07 | 5 |
//! | 0x16 | 10 |

use crc::{Crc, CRC_16_MODBUS};
use thiserror::Error;

use crate::models::{ModelError, Request, Response, SlaveId, EXCEPTION_FLAG};

/// CRC calculator for RTU frames.
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Maximum RTU frame size (address + 253-byte PDU + CRC).
pub const MAX_FRAME_SIZE: usize = 256;

/// Smallest possible frame: address, function code, CRC.
pub const MIN_FRAME_SIZE: usize = 4;

/// Compute the CRC-16/MODBUS checksum of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Errors raised while framing or unframing bus data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than address + function code + CRC.
    #[error("frame of {0} bytes is too short")]
    Truncated(usize),

    /// Frame longer than the bus allows.
    #[error("frame of {0} bytes exceeds maximum {max}", max = MAX_FRAME_SIZE)]
    Oversized(usize),

    /// Checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    /// The frame length of this function code is unknown.
    #[error("unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),

    /// Frame content is not a valid message.
    #[error("invalid message: {0}")]
    Model(#[from] ModelError),
}

/// One bus frame, checksum included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wrap raw bytes without validation.
    ///
    /// Accessors assume at least an address and function code; use
    /// [`FrameCodec::parse`] or [`FrameCodec::decode`] for untrusted input.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Bytes as they appear on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Address byte.
    pub fn slave_id(&self) -> SlaveId {
        SlaveId(self.bytes.first().copied().unwrap_or_default())
    }

    /// Function code byte as sent (exception flag not cleared).
    pub fn function_code(&self) -> u8 {
        self.bytes.get(1).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Converts protocol messages to bus frames and back.
///
/// Implementations must be stateless or internally synchronized: `parse` is
/// called from the transport's reader while `encode` runs on the caller.
pub trait FrameCodec: Send + Sync + 'static {
    /// Encode a request into a bus frame.
    fn encode(&self, request: &Request) -> Frame;

    /// Split one complete frame off the front of `buffer`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. On error the buffer
    /// contents are unusable and should be discarded.
    fn parse(&self, buffer: &mut Vec<u8>) -> Result<Option<Frame>, FrameError>;

    /// Unwrap a response frame into a protocol message.
    fn decode(&self, frame: &Frame) -> Result<Response, FrameError>;
}

/// RTU codec for the master side of the bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtuCodec;

impl RtuCodec {
    /// Length of the reply frame at the front of `buffer`, if determinable.
    fn reply_len(buffer: &[u8]) -> Result<Option<usize>, FrameError> {
        let Some(&function) = buffer.get(1) else {
            return Ok(None);
        };

        if function & EXCEPTION_FLAG != 0 {
            return Ok(Some(5));
        }

        let len = match function {
            0x01..=0x04 | 0x0C | 0x11 | 0x14 | 0x15 | 0x17 => match buffer.get(2) {
                Some(&byte_count) => 3 + byte_count as usize + 2,
                None => return Ok(None),
            },
            0x05 | 0x06 | 0x08 | 0x0B | 0x0F | 0x10 => 8,
            0x07 => 5,
            0x16 => 10,
            other => return Err(FrameError::UnsupportedFunction(other)),
        };

        Ok(Some(len))
    }

    fn check_crc(bytes: &[u8]) -> Result<(), FrameError> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let (body, tail) = bytes.split_at(bytes.len() - 2);
        let received = u16::from_le_bytes([tail[0], tail[1]]);
        let expected = crc16(body);
        if received != expected {
            return Err(FrameError::CrcMismatch { expected, received });
        }
        Ok(())
    }
}

impl FrameCodec for RtuCodec {
    fn encode(&self, request: &Request) -> Frame {
        let mut bytes = Vec::with_capacity(request.pdu().len() + 3);
        bytes.push(request.slave_id().get());
        bytes.extend_from_slice(request.pdu());
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Frame::from_bytes(bytes)
    }

    fn parse(&self, buffer: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
        let Some(len) = Self::reply_len(buffer)? else {
            return Ok(None);
        };
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(len));
        }
        if buffer.len() < len {
            return Ok(None);
        }

        let bytes: Vec<u8> = buffer.drain(..len).collect();
        Self::check_crc(&bytes)?;
        Ok(Some(Frame::from_bytes(bytes)))
    }

    fn decode(&self, frame: &Frame) -> Result<Response, FrameError> {
        let bytes = frame.as_bytes();
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(bytes.len()));
        }
        Self::check_crc(bytes)?;

        let pdu = bytes[1..bytes.len() - 2].to_vec();
        Ok(Response::new(frame.slave_id(), pdu)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Build a reply frame with a valid CRC.
    fn reply(bytes: &[u8]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        out.extend_from_slice(&crc16(bytes).to_le_bytes());
        out
    }

    #[test]
    fn test_crc_known_vector() {
        // Read 10 holding registers from slave 1: 01 03 00 00 00 0A C5 CD
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
    }

    #[test]
    fn test_encode_request() {
        let frame = RtuCodec.encode(&Request::read_holding_registers(1, 0, 10));
        assert_eq!(
            frame.as_bytes(),
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]
        );
        assert_eq!(frame.slave_id(), SlaveId(1));
        assert_eq!(frame.function_code(), 0x03);
    }

    #[test]
    fn test_parse_needs_more_bytes() {
        let full = reply(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        for cut in 0..full.len() {
            let mut buffer = full[..cut].to_vec();
            assert_eq!(RtuCodec.parse(&mut buffer), Ok(None), "cut at {}", cut);
            assert_eq!(buffer.len(), cut, "partial data must stay buffered");
        }
    }

    #[test]
    fn test_parse_read_reply() {
        let mut buffer = reply(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let frame = RtuCodec.parse(&mut buffer).unwrap().unwrap();
        assert!(buffer.is_empty());

        let response = RtuCodec.decode(&frame).unwrap();
        assert_eq!(response.slave_id(), SlaveId(1));
        assert_eq!(response.registers(), Some(vec![42]));
    }

    #[test]
    fn test_parse_echo_reply() {
        let mut buffer = reply(&[0x11, 0x06, 0x00, 0x01, 0x00, 0x03]);
        let frame = RtuCodec.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_parse_exception_reply() {
        let mut buffer = reply(&[0x0A, 0x83, 0x02]);
        let frame = RtuCodec.parse(&mut buffer).unwrap().unwrap();
        let response = RtuCodec.decode(&frame).unwrap();
        assert!(response.is_exception());
        assert_eq!(response.exception_code(), Some(0x02));
    }

    #[test]
    fn test_parse_back_to_back_frames() {
        let mut buffer = reply(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        buffer.extend(reply(&[0x02, 0x83, 0x01]));
        buffer.push(0x03);

        let first = RtuCodec.parse(&mut buffer).unwrap().unwrap();
        let second = RtuCodec.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(first.slave_id(), SlaveId(1));
        assert_eq!(second.slave_id(), SlaveId(2));
        assert_eq!(RtuCodec.parse(&mut buffer), Ok(None));
        assert_eq!(buffer, vec![0x03]);
    }

    #[test]
    fn test_parse_crc_mismatch() {
        let mut buffer = reply(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        buffer[3] ^= 0xFF;
        let err = RtuCodec.parse(&mut buffer).unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { .. }));
    }

    #[test]
    fn test_parse_unsupported_function() {
        let mut buffer = vec![0x01, 0x2B, 0x0E];
        assert_eq!(
            RtuCodec.parse(&mut buffer),
            Err(FrameError::UnsupportedFunction(0x2B))
        );
    }

    #[test]
    fn test_decode_truncated() {
        let frame = Frame::from_bytes(vec![0x01, 0x03]);
        assert_eq!(RtuCodec.decode(&frame), Err(FrameError::Truncated(2)));
    }

    #[test]
    fn test_decode_address_only() {
        // Address + CRC only is shorter than MIN_FRAME_SIZE.
        let frame = Frame::from_bytes(reply(&[0x01]));
        assert_eq!(RtuCodec.decode(&frame), Err(FrameError::Truncated(3)));
    }

    #[test]
    fn test_error_display() {
        let err = FrameError::CrcMismatch {
            expected: 0xCDC5,
            received: 0x0000,
        };
        assert_eq!(
            err.to_string(),
            "CRC mismatch: expected 0xcdc5, received 0x0000"
        );
    }
}
