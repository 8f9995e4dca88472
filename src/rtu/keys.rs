//! Correlation keys for a serial bus.

use crate::exchange::{CorrelationKey, KeyStrategy};
use crate::models::EXCEPTION_FLAG;
use crate::rtu::Frame;

/// Matches replies to requests by device address and function code.
///
/// A serial bus has no transaction ids; a device answers the one request it
/// was sent. The exception flag is cleared so that an exception reply matches
/// the request that caused it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialKeys;

impl KeyStrategy for SerialKeys {
    fn key(&self, frame: &Frame) -> CorrelationKey {
        CorrelationKey::new(frame.slave_id(), frame.function_code() & !EXCEPTION_FLAG)
    }
}
