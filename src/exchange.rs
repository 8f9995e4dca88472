//! Request/response exchange over one transport.
//!
//! The [`ExchangeCoordinator`] turns a transport that only writes bytes and
//! pushes received bytes into a blocking call: submit a frame, get the
//! matching reply frame back.
//!
//! # Correlation
//!
//! ```text
//!  caller thread                         transport reader
//!  ─────────────                         ────────────────
//!  enter(key) ──► waiting room ◄──────── parse(buffer) → deliver(key, frame)
//!  write(frame)        │
//!  wait(key) ◄─────────┘ (condvar)
//!  leave(key)
//! ```
//!
//! The waiting room is the only state shared between the calling thread and
//! the reader; it is guarded by one mutex and one condition variable. Only one
//! exchange per correlation key can be pending at a time.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::SlaveId;
use crate::rtu::{Frame, FrameCodec, FrameError};
use crate::transport::{DataConsumer, Transport};

/// Identifies which pending request a reply frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    slave_id: SlaveId,
    function: u8,
}

impl CorrelationKey {
    pub fn new(slave_id: SlaveId, function: u8) -> Self {
        Self { slave_id, function }
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    pub fn function(&self) -> u8 {
        self.function
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slave {} fc {:#04x}", self.slave_id, self.function)
    }
}

/// Derives correlation keys from frames.
///
/// The same strategy is applied to outgoing requests and incoming replies; a
/// reply matches when both produce the same key.
pub trait KeyStrategy: Send + Sync {
    fn key(&self, frame: &Frame) -> CorrelationKey;
}

/// Receives reply frames nobody was waiting for.
pub trait FrameListener: Send + Sync {
    fn unsolicited(&self, frame: Frame);
}

/// Exchange failures.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No matching reply before the read timeout.
    #[error("no response for {key} within {}ms", .timeout.as_millis())]
    Timeout {
        key: CorrelationKey,
        timeout: Duration,
    },

    /// The transport reported the stream as ended.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The coordinator was stopped.
    #[error("exchange coordinator stopped")]
    Stopped,

    /// An exchange with the same key is already pending.
    #[error("an exchange for {0} is already pending")]
    Busy(CorrelationKey),

    /// Writing the request failed.
    #[error("failed to write request: {0}")]
    Write(#[source] io::Error),

    /// The reply frame could not be unwrapped.
    #[error("invalid response frame: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoomState {
    Open,
    Lost(String),
    Stopped,
}

#[derive(Debug)]
struct WaitingRoom {
    /// Pending keys; `Some` once the reply has been delivered.
    pending: HashMap<CorrelationKey, Option<Frame>>,
    state: RoomState,
}

impl WaitingRoom {
    fn check_open(&self) -> Result<(), ExchangeError> {
        match &self.state {
            RoomState::Open => Ok(()),
            RoomState::Lost(reason) => Err(ExchangeError::ConnectionLost(reason.clone())),
            RoomState::Stopped => Err(ExchangeError::Stopped),
        }
    }

    fn take_reply(&mut self, key: &CorrelationKey) -> Option<Frame> {
        self.pending.get_mut(key).and_then(Option::take)
    }
}

/// Inbound side: buffers bytes from the transport and fills the waiting room.
struct Inbound<C> {
    room: Mutex<WaitingRoom>,
    arrived: Condvar,
    buffer: Mutex<Vec<u8>>,
    codec: Arc<C>,
    keys: Arc<dyn KeyStrategy>,
    listener: Option<Arc<dyn FrameListener>>,
}

impl<C: FrameCodec> Inbound<C> {
    fn deliver(&self, frame: Frame) {
        let key = self.keys.key(&frame);
        {
            let mut room = self.room.lock();
            if let Some(slot) = room.pending.get_mut(&key).filter(|slot| slot.is_none()) {
                *slot = Some(frame);
                self.arrived.notify_all();
                return;
            }
        }

        match &self.listener {
            Some(listener) => listener.unsolicited(frame),
            None => debug!("Dropping unsolicited frame for {}", key),
        }
    }

    fn enter(&self, key: CorrelationKey) -> Result<(), ExchangeError> {
        let mut room = self.room.lock();
        room.check_open()?;
        if room.pending.contains_key(&key) {
            return Err(ExchangeError::Busy(key));
        }
        room.pending.insert(key, None);
        Ok(())
    }

    fn leave(&self, key: &CorrelationKey) {
        self.room.lock().pending.remove(key);
    }

    fn wait(&self, key: CorrelationKey, timeout: Duration) -> Result<Frame, ExchangeError> {
        let deadline = Instant::now() + timeout;
        let mut room = self.room.lock();
        loop {
            if let Some(frame) = room.take_reply(&key) {
                return Ok(frame);
            }
            room.check_open()?;
            if self.arrived.wait_until(&mut room, deadline).timed_out() {
                return room
                    .take_reply(&key)
                    .ok_or(ExchangeError::Timeout { key, timeout });
            }
        }
    }

    fn shut(&self, state: RoomState) {
        let mut room = self.room.lock();
        if room.state == RoomState::Open {
            room.state = state;
        }
        self.arrived.notify_all();
    }
}

impl<C: FrameCodec> DataConsumer for Inbound<C> {
    fn data(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock();
        buffer.extend_from_slice(bytes);

        loop {
            match self.codec.parse(&mut buffer) {
                Ok(Some(frame)) => self.deliver(frame),
                Ok(None) => break,
                Err(e) => {
                    warn!("Discarding {} bytes of bus data: {}", buffer.len(), e);
                    buffer.clear();
                    break;
                }
            }
        }
    }

    fn terminated(&self, reason: io::Error) {
        debug!("Transport terminated: {}", reason);
        self.shut(RoomState::Lost(reason.to_string()));
    }
}

/// Serializes request/response exchanges over one transport.
///
/// # Example
///
/// ```ignore
/// let coordinator = ExchangeCoordinator::start(
///     transport,
///     Arc::new(RtuCodec),
///     None,
///     Arc::new(SerialKeys),
///     Duration::from_millis(500),
/// );
/// let reply = coordinator.submit(&frame)?;
/// ```
pub struct ExchangeCoordinator<C, T> {
    inbound: Arc<Inbound<C>>,
    transport: T,
    timeout: Duration,
}

impl<C: FrameCodec, T: Transport> ExchangeCoordinator<C, T> {
    /// Bind a coordinator to `transport` and register it as the consumer.
    ///
    /// Transports that need an explicit start step must be started after
    /// this call so that no inbound bytes are missed.
    pub fn start(
        transport: T,
        codec: Arc<C>,
        listener: Option<Arc<dyn FrameListener>>,
        keys: Arc<dyn KeyStrategy>,
        timeout: Duration,
    ) -> Self {
        let inbound = Arc::new(Inbound {
            room: Mutex::new(WaitingRoom {
                pending: HashMap::new(),
                state: RoomState::Open,
            }),
            arrived: Condvar::new(),
            buffer: Mutex::new(Vec::new()),
            codec,
            keys,
            listener,
        });
        transport.set_consumer(inbound.clone());

        Self {
            inbound,
            transport,
            timeout,
        }
    }

    /// The bound transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check if the transport has reported the connection as lost.
    pub fn is_lost(&self) -> bool {
        matches!(self.inbound.room.lock().state, RoomState::Lost(_))
    }

    /// Send `frame` and wait for its reply.
    ///
    /// Broadcast frames are written and return `Ok(None)` right away: no
    /// device answers a broadcast.
    ///
    /// # Errors
    ///
    /// - `ExchangeError::ConnectionLost` / `Stopped` if the connection is gone
    /// - `ExchangeError::Busy` if the same key is already pending
    /// - `ExchangeError::Write` if the transport rejects the write
    /// - `ExchangeError::Timeout` if no reply arrives within the read timeout
    pub fn submit(&self, frame: &Frame) -> Result<Option<Frame>, ExchangeError> {
        if frame.slave_id().is_broadcast() {
            self.inbound.room.lock().check_open()?;
            self.transport
                .write(frame.as_bytes())
                .map_err(ExchangeError::Write)?;
            return Ok(None);
        }

        let key = self.inbound.keys.key(frame);
        self.inbound.enter(key)?;

        let outcome = self
            .transport
            .write(frame.as_bytes())
            .map_err(ExchangeError::Write)
            .and_then(|()| self.inbound.wait(key, self.timeout));

        self.inbound.leave(&key);
        outcome.map(Some)
    }

    /// Fail any pending exchange, then close the transport.
    pub fn stop(&self) -> io::Result<()> {
        self.inbound.shut(RoomState::Stopped);
        self.inbound.buffer.lock().clear();
        self.transport.close()
    }
}
