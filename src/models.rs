//! Data models for fieldbus requests and responses.
//!
//! A [`Request`] is an opaque protocol data unit (function code followed by
//! function-specific data) addressed to one device on the serial bus. The
//! master never interprets the PDU beyond the function code; framing and
//! checksums are the job of [`crate::rtu`].
//!
//! Convenience builders are provided for the common function codes so callers
//! don't have to hand-assemble byte vectors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest PDU that fits into a 256-byte RTU frame (address + PDU + CRC).
pub const MAX_PDU_SIZE: usize = 253;

/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum number of registers in a single write-multiple request.
const MAX_WRITE_REGISTERS: usize = 123;

/// Errors raised while building protocol messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// A PDU must contain at least a function code.
    #[error("PDU is empty")]
    EmptyPdu,

    /// PDU does not fit into a single bus frame.
    #[error("PDU of {0} bytes exceeds maximum {max}", max = MAX_PDU_SIZE)]
    PduTooLong(usize),

    /// Register count outside what one write request can carry.
    #[error("invalid register count {0} (expected 1..={max})", max = MAX_WRITE_REGISTERS)]
    RegisterCount(usize),
}

/// Bus address of a device behind the gateway.
///
/// Address 0 is the broadcast address: every device acts on the request and
/// none of them replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlaveId(pub u8);

impl SlaveId {
    /// The broadcast address.
    pub const BROADCAST: SlaveId = SlaveId(0);

    /// Raw address byte.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Check if this is the broadcast address.
    pub fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for SlaveId {
    fn from(value: u8) -> Self {
        SlaveId(value)
    }
}

/// Function codes with a well-known frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    ReadExceptionStatus = 0x07,
    Diagnostics = 0x08,
    GetCommEventCounter = 0x0B,
    GetCommEventLog = 0x0C,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReportSlaveId = 0x11,
    ReadFileRecord = 0x14,
    WriteFileRecord = 0x15,
    MaskWriteRegister = 0x16,
    ReadWriteMultipleRegisters = 0x17,
}

impl FunctionCode {
    /// Look up a function code, ignoring the exception flag.
    pub fn from_u8(code: u8) -> Option<Self> {
        let code = code & !EXCEPTION_FLAG;
        let fc = match code {
            0x01 => FunctionCode::ReadCoils,
            0x02 => FunctionCode::ReadDiscreteInputs,
            0x03 => FunctionCode::ReadHoldingRegisters,
            0x04 => FunctionCode::ReadInputRegisters,
            0x05 => FunctionCode::WriteSingleCoil,
            0x06 => FunctionCode::WriteSingleRegister,
            0x07 => FunctionCode::ReadExceptionStatus,
            0x08 => FunctionCode::Diagnostics,
            0x0B => FunctionCode::GetCommEventCounter,
            0x0C => FunctionCode::GetCommEventLog,
            0x0F => FunctionCode::WriteMultipleCoils,
            0x10 => FunctionCode::WriteMultipleRegisters,
            0x11 => FunctionCode::ReportSlaveId,
            0x14 => FunctionCode::ReadFileRecord,
            0x15 => FunctionCode::WriteFileRecord,
            0x16 => FunctionCode::MaskWriteRegister,
            0x17 => FunctionCode::ReadWriteMultipleRegisters,
            _ => return None,
        };
        Some(fc)
    }

    /// Wire value of this function code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Get a short display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::ReadExceptionStatus => "Read Exception Status",
            FunctionCode::Diagnostics => "Diagnostics",
            FunctionCode::GetCommEventCounter => "Get Comm Event Counter",
            FunctionCode::GetCommEventLog => "Get Comm Event Log",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
            FunctionCode::ReportSlaveId => "Report Slave ID",
            FunctionCode::ReadFileRecord => "Read File Record",
            FunctionCode::WriteFileRecord => "Write File Record",
            FunctionCode::MaskWriteRegister => "Mask Write Register",
            FunctionCode::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
        }
    }
}

/// A protocol request addressed to one device.
///
/// Immutable once built: the master may encode and resend the same request
/// during connection recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    slave_id: SlaveId,
    pdu: Vec<u8>,
}

impl Request {
    /// Build a request from a raw PDU (function code + data).
    pub fn new(slave_id: impl Into<SlaveId>, pdu: Vec<u8>) -> Result<Self, ModelError> {
        check_pdu(&pdu)?;
        Ok(Self {
            slave_id: slave_id.into(),
            pdu,
        })
    }

    /// Read `count` coils starting at `start`.
    pub fn read_coils(slave_id: impl Into<SlaveId>, start: u16, count: u16) -> Self {
        Self::read(slave_id.into(), FunctionCode::ReadCoils, start, count)
    }

    /// Read `count` discrete inputs starting at `start`.
    pub fn read_discrete_inputs(slave_id: impl Into<SlaveId>, start: u16, count: u16) -> Self {
        Self::read(slave_id.into(), FunctionCode::ReadDiscreteInputs, start, count)
    }

    /// Read `count` holding registers starting at `start`.
    pub fn read_holding_registers(slave_id: impl Into<SlaveId>, start: u16, count: u16) -> Self {
        Self::read(slave_id.into(), FunctionCode::ReadHoldingRegisters, start, count)
    }

    /// Read `count` input registers starting at `start`.
    pub fn read_input_registers(slave_id: impl Into<SlaveId>, start: u16, count: u16) -> Self {
        Self::read(slave_id.into(), FunctionCode::ReadInputRegisters, start, count)
    }

    /// Force a single coil on or off.
    pub fn write_single_coil(slave_id: impl Into<SlaveId>, address: u16, on: bool) -> Self {
        let value: u16 = if on { 0xFF00 } else { 0x0000 };
        Self::address_value(slave_id.into(), FunctionCode::WriteSingleCoil, address, value)
    }

    /// Write a single holding register.
    pub fn write_single_register(slave_id: impl Into<SlaveId>, address: u16, value: u16) -> Self {
        Self::address_value(slave_id.into(), FunctionCode::WriteSingleRegister, address, value)
    }

    /// Write a block of holding registers starting at `start`.
    pub fn write_multiple_registers(
        slave_id: impl Into<SlaveId>,
        start: u16,
        values: &[u16],
    ) -> Result<Self, ModelError> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(ModelError::RegisterCount(values.len()));
        }

        let mut pdu = Vec::with_capacity(6 + values.len() * 2);
        pdu.push(FunctionCode::WriteMultipleRegisters.code());
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
        pdu.push((values.len() * 2) as u8);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }

        Self::new(slave_id, pdu)
    }

    fn read(slave_id: SlaveId, fc: FunctionCode, start: u16, count: u16) -> Self {
        Self::address_value(slave_id, fc, start, count)
    }

    fn address_value(slave_id: SlaveId, fc: FunctionCode, first: u16, second: u16) -> Self {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(fc.code());
        pdu.extend_from_slice(&first.to_be_bytes());
        pdu.extend_from_slice(&second.to_be_bytes());
        Self { slave_id, pdu }
    }

    /// Target device.
    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    /// Function code byte.
    pub fn function_code(&self) -> u8 {
        self.pdu[0]
    }

    /// Full PDU, function code included.
    pub fn pdu(&self) -> &[u8] {
        &self.pdu
    }

    /// Broadcast requests never get a reply.
    pub fn expects_response(&self) -> bool {
        !self.slave_id.is_broadcast()
    }
}

/// A protocol response from one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    slave_id: SlaveId,
    pdu: Vec<u8>,
}

impl Response {
    /// Build a response from a raw PDU (function code + data).
    pub fn new(slave_id: impl Into<SlaveId>, pdu: Vec<u8>) -> Result<Self, ModelError> {
        check_pdu(&pdu)?;
        Ok(Self {
            slave_id: slave_id.into(),
            pdu,
        })
    }

    /// Responding device.
    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    /// Function code of the originating request (exception flag cleared).
    pub fn function_code(&self) -> u8 {
        self.pdu[0] & !EXCEPTION_FLAG
    }

    /// Full PDU, function code included.
    pub fn pdu(&self) -> &[u8] {
        &self.pdu
    }

    /// Function-specific data following the function code.
    pub fn data(&self) -> &[u8] {
        &self.pdu[1..]
    }

    /// Check if the device answered with an exception.
    pub fn is_exception(&self) -> bool {
        self.pdu[0] & EXCEPTION_FLAG != 0
    }

    /// Exception code, if this is an exception response.
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.pdu.get(1).copied()
        } else {
            None
        }
    }

    /// Decode register values from a read-registers response.
    ///
    /// Returns `None` for exceptions, other function codes, or a byte count
    /// that doesn't match the payload.
    pub fn registers(&self) -> Option<Vec<u16>> {
        if self.is_exception() {
            return None;
        }
        match FunctionCode::from_u8(self.function_code())? {
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters
            | FunctionCode::ReadWriteMultipleRegisters => {}
            _ => return None,
        }

        let (&byte_count, body) = self.data().split_first()?;
        if body.len() != byte_count as usize || byte_count % 2 != 0 {
            return None;
        }

        Some(
            body.chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        )
    }
}

fn check_pdu(pdu: &[u8]) -> Result<(), ModelError> {
    if pdu.is_empty() {
        return Err(ModelError::EmptyPdu);
    }
    if pdu.len() > MAX_PDU_SIZE {
        return Err(ModelError::PduTooLong(pdu.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_read_holding_registers_pdu() {
        let request = Request::read_holding_registers(1, 0x0000, 0x000A);
        assert_eq!(request.pdu(), &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(request.slave_id(), SlaveId(1));
        assert!(request.expects_response());
    }

    #[test]
    fn test_write_single_coil_values() {
        let on = Request::write_single_coil(2, 0x00AC, true);
        assert_eq!(on.pdu(), &[0x05, 0x00, 0xAC, 0xFF, 0x00]);

        let off = Request::write_single_coil(2, 0x00AC, false);
        assert_eq!(off.pdu(), &[0x05, 0x00, 0xAC, 0x00, 0x00]);
    }

    #[test]
    fn test_write_multiple_registers_layout() {
        let request = Request::write_multiple_registers(17, 0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            request.pdu(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_write_multiple_registers_limits() {
        assert_eq!(
            Request::write_multiple_registers(1, 0, &[]),
            Err(ModelError::RegisterCount(0))
        );
        let too_many = vec![0u16; MAX_WRITE_REGISTERS + 1];
        assert!(Request::write_multiple_registers(1, 0, &too_many).is_err());
    }

    #[test]
    fn test_broadcast_expects_no_response() {
        let request = Request::write_single_register(SlaveId::BROADCAST, 1, 2);
        assert!(!request.expects_response());
        assert!(request.slave_id().is_broadcast());
    }

    #[test]
    fn test_request_rejects_bad_pdu() {
        assert_eq!(Request::new(1, vec![]), Err(ModelError::EmptyPdu));
        assert_eq!(
            Request::new(1, vec![0; MAX_PDU_SIZE + 1]),
            Err(ModelError::PduTooLong(MAX_PDU_SIZE + 1))
        );
    }

    #[test]
    fn test_response_registers() {
        let response = Response::new(1, vec![0x03, 0x04, 0x00, 0x2A, 0x01, 0x00]).unwrap();
        assert!(!response.is_exception());
        assert_eq!(response.registers(), Some(vec![42, 256]));
    }

    #[test]
    fn test_response_registers_byte_count_mismatch() {
        let response = Response::new(1, vec![0x03, 0x06, 0x00, 0x2A]).unwrap();
        assert_eq!(response.registers(), None);
    }

    #[test]
    fn test_exception_response() {
        let response = Response::new(5, vec![0x83, 0x02]).unwrap();
        assert!(response.is_exception());
        assert_eq!(response.function_code(), 0x03);
        assert_eq!(response.exception_code(), Some(0x02));
        assert_eq!(response.registers(), None);
    }

    #[test]
    fn test_function_code_lookup_ignores_exception_flag() {
        assert_eq!(FunctionCode::from_u8(0x86), Some(FunctionCode::WriteSingleRegister));
        assert_eq!(FunctionCode::from_u8(0x2B), None);
        assert_eq!(FunctionCode::ReadCoils.as_str(), "Read Coils");
    }

    #[test]
    fn test_slave_id_serde_transparent() {
        let json = serde_json::to_string(&SlaveId(7)).unwrap();
        assert_eq!(json, "7");
        let back: SlaveId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SlaveId(7));
    }
}
