//! RTU bus framing carried over a TCP stream.
//!
//! Serial-to-TCP gateways forward the raw serial bytes unchanged, so the
//! master has to speak the serial framing on a network socket instead of the
//! native TCP framing.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────┬───────────────┬───────────┬───────────┐
//! │ address  │ PDU           │ CRC low   │ CRC high  │
//! │ 1 byte   │ 1..=253 bytes │ 1 byte    │ 1 byte    │
//! └──────────┴───────────────┴───────────┴───────────┘
//! ```
//!
//! The CRC is CRC-16/MODBUS over address and PDU, sent little-endian. There
//! is no length field; frame boundaries in the response stream are derived
//! from the function code (see [`RtuCodec`]).

mod framing;
mod keys;

pub use framing::{crc16, Frame, FrameCodec, FrameError, RtuCodec, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
pub use keys::SerialKeys;
