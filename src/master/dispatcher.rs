//! Public entry point: [`TcpRtuMaster`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use super::connection::{ConnectionStats, ConnectionSupervisor};
use super::error::{DiagnosticSink, MasterError, TracingSink};
use crate::config::{ConfigError, MasterConfig};
use crate::exchange::{ExchangeError, FrameListener, KeyStrategy};
use crate::models::{Request, Response, SlaveId};
use crate::rtu::{Frame, FrameCodec, RtuCodec, SerialKeys};

/// Fieldbus master speaking RTU frames to a serial-to-TCP gateway.
///
/// All operations run under one lock per master: concurrent callers are
/// served one after another, and `destroy` waits for an in-flight `send`
/// instead of cancelling it.
pub struct TcpRtuMaster<C: FrameCodec = RtuCodec> {
    keep_alive: bool,
    codec: Arc<C>,
    state: Mutex<MasterState<C>>,
}

struct MasterState<C: FrameCodec> {
    initialized: bool,
    supervisor: ConnectionSupervisor<C>,
}

impl TcpRtuMaster<RtuCodec> {
    /// Master with default collaborators.
    pub fn new(config: MasterConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: MasterConfig) -> MasterBuilder<RtuCodec> {
        MasterBuilder::new(config)
    }
}

impl<C: FrameCodec> TcpRtuMaster<C> {
    /// Initialize the master.
    ///
    /// In persistent mode this opens the connection (unless one is already
    /// open); in per-call mode it only marks the master ready.
    pub fn init(&self) -> Result<(), MasterError> {
        let mut state = self.state.lock();

        if self.keep_alive && !state.supervisor.is_open() {
            state.supervisor.open().map_err(MasterError::Init)?;
        }
        state.initialized = true;

        info!(
            "Master initialized ({} connection)",
            if self.keep_alive { "persistent" } else { "per-call" }
        );
        Ok(())
    }

    /// Close any open connection and mark the master uninitialized.
    ///
    /// Idempotent and infallible; cleanup failures go to the diagnostic sink.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.supervisor.close();
        if state.initialized {
            info!("Master destroyed");
        }
        state.initialized = false;
    }

    /// Send `request` and wait for the device's reply.
    ///
    /// Returns `Ok(None)` when no reply is expected (broadcast).
    ///
    /// # Errors
    ///
    /// - `MasterError::NotInitialized` before `init` or after `destroy`
    /// - `MasterError::Connect` if no connection could be opened
    /// - `MasterError::TerminalExchange` if the exchange failed for good
    ///
    /// In persistent mode a failed exchange is retried once on a fresh
    /// connection; only the second failure is returned.
    pub fn send(&self, request: &Request) -> Result<Option<Response>, MasterError> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(MasterError::NotInitialized);
        }

        let slave_id = request.slave_id();
        let session = Session {
            supervisor: &mut state.supervisor,
            close_on_exit: !self.keep_alive,
        };

        if !self.keep_alive || !session.supervisor.is_open() {
            session
                .supervisor
                .open()
                .map_err(|source| MasterError::Connect { slave_id, source })?;
        }

        let frame = self.codec.encode(request);
        debug!(
            "Sending to slave {}: {}",
            slave_id,
            hex::encode(frame.as_bytes())
        );

        let reply = match session.supervisor.submit(&frame) {
            Ok(reply) => reply,
            Err(first) if self.keep_alive => {
                self.recover(&mut *session.supervisor, slave_id, &frame, first)?
            }
            Err(source) => return Err(MasterError::TerminalExchange { slave_id, source }),
        };
        drop(session);

        self.decode(slave_id, reply)
    }

    /// Reopen the connection and resubmit `frame` once.
    fn recover(
        &self,
        supervisor: &mut ConnectionSupervisor<C>,
        slave_id: SlaveId,
        frame: &Frame,
        first: ExchangeError,
    ) -> Result<Option<Frame>, MasterError> {
        error!("Exchange with slave {} failed, reconnecting: {}", slave_id, first);
        supervisor.sink().report(&MasterError::TransientExchange {
            slave_id,
            source: first,
        });
        supervisor.record_recovery();

        if let Err(source) = supervisor.open() {
            supervisor.close();
            return Err(MasterError::Connect { slave_id, source });
        }

        match supervisor.submit(frame) {
            Ok(reply) => Ok(reply),
            Err(source) => {
                supervisor.close();
                Err(MasterError::TerminalExchange { slave_id, source })
            }
        }
    }

    fn decode(
        &self,
        slave_id: SlaveId,
        reply: Option<Frame>,
    ) -> Result<Option<Response>, MasterError> {
        let Some(frame) = reply else {
            return Ok(None);
        };
        debug!(
            "Reply from slave {}: {}",
            slave_id,
            hex::encode(frame.as_bytes())
        );

        self.codec
            .decode(&frame)
            .map(Some)
            .map_err(|e| MasterError::TerminalExchange {
                slave_id,
                source: ExchangeError::Frame(e),
            })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Check if a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().supervisor.is_open()
    }

    /// Id of the open connection; changes on every reconnect.
    pub fn connection_id(&self) -> Option<u64> {
        self.state.lock().supervisor.connection_id()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.state.lock().supervisor.stats()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

impl<C: FrameCodec> fmt::Debug for TcpRtuMaster<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpRtuMaster")
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

/// Closes the connection when a per-call `send` returns, on every path.
struct Session<'a, C: FrameCodec> {
    supervisor: &'a mut ConnectionSupervisor<C>,
    close_on_exit: bool,
}

impl<C: FrameCodec> Drop for Session<'_, C> {
    fn drop(&mut self) {
        if self.close_on_exit {
            self.supervisor.close();
        }
    }
}

/// Builder for [`TcpRtuMaster`] with non-default collaborators.
///
/// # Example
///
/// ```ignore
/// let runtime = tokio::runtime::Runtime::new()?;
/// let master = TcpRtuMaster::builder(config)
///     .multiplexer(runtime.handle().clone())
///     .sink(|e: &MasterError| eprintln!("{}", e))
///     .build()?;
/// ```
pub struct MasterBuilder<C: FrameCodec = RtuCodec> {
    config: MasterConfig,
    codec: Arc<C>,
    multiplexer: Option<Handle>,
    sink: Arc<dyn DiagnosticSink>,
    keys: Arc<dyn KeyStrategy>,
    listener: Option<Arc<dyn FrameListener>>,
    pause: Option<Arc<dyn Fn(Duration) + Send + Sync>>,
}

impl MasterBuilder<RtuCodec> {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            config,
            codec: Arc::new(RtuCodec),
            multiplexer: None,
            sink: Arc::new(TracingSink),
            keys: Arc::new(SerialKeys),
            listener: None,
            pause: None,
        }
    }
}

impl<C: FrameCodec> MasterBuilder<C> {
    /// Use a different frame codec.
    pub fn codec<D: FrameCodec>(self, codec: D) -> MasterBuilder<D> {
        MasterBuilder {
            config: self.config,
            codec: Arc::new(codec),
            multiplexer: self.multiplexer,
            sink: self.sink,
            keys: self.keys,
            listener: self.listener,
            pause: self.pause,
        }
    }

    /// Drive connections with the multiplexed transport on `runtime`.
    pub fn multiplexer(mut self, runtime: Handle) -> Self {
        self.multiplexer = Some(runtime);
        self
    }

    /// Where secondary errors are reported.
    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn keys(mut self, keys: impl KeyStrategy + 'static) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    /// Receives reply frames nobody waits for.
    pub fn listener(mut self, listener: impl FrameListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Replace the wait between connection attempts.
    pub fn pause(mut self, pause: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.pause = Some(Arc::new(pause));
        self
    }

    /// Validate the configuration and build the master.
    pub fn build(self) -> Result<TcpRtuMaster<C>, ConfigError> {
        self.config.validate()?;

        let mut supervisor = ConnectionSupervisor::new(&self.config, Arc::clone(&self.codec))
            .with_multiplexer(self.multiplexer)
            .with_keys(self.keys)
            .with_listener(self.listener)
            .with_sink(self.sink);
        if let Some(pause) = self.pause {
            supervisor = supervisor.with_pause(pause);
        }

        Ok(TcpRtuMaster {
            keep_alive: self.config.keep_alive,
            codec: self.codec,
            state: Mutex::new(MasterState {
                initialized: false,
                supervisor,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::ErrorKind;
    use std::net::TcpListener;

    fn unreachable_config() -> MasterConfig {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        MasterConfig::new("127.0.0.1", port).retries(0)
    }

    #[test]
    fn test_send_before_init_fails() {
        let master = TcpRtuMaster::new(unreachable_config()).unwrap();
        let err = master
            .send(&Request::read_holding_registers(1, 0, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert!(!master.is_initialized());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = MasterConfig::new("", 502);
        assert!(matches!(
            TcpRtuMaster::new(config),
            Err(ConfigError::EmptyHost)
        ));
    }

    #[test]
    fn test_per_call_init_does_not_connect() {
        let master = TcpRtuMaster::new(unreachable_config().keep_alive(false)).unwrap();
        master.init().unwrap();
        assert!(master.is_initialized());
        assert!(!master.is_connected());
        assert_eq!(master.stats().connect_failures, 0);
    }

    #[test]
    fn test_persistent_init_fails_when_unreachable() {
        let master = TcpRtuMaster::builder(unreachable_config())
            .pause(|_| {})
            .build()
            .unwrap();
        let err = master.init().unwrap_err();
        assert!(matches!(err, MasterError::Init(_)));
        assert!(!master.is_initialized());
    }

    #[test]
    fn test_destroy_without_init() {
        let master = TcpRtuMaster::new(unreachable_config()).unwrap();
        master.destroy();
        master.destroy();
        assert_eq!(master.stats().closes, 0);
    }

    #[test]
    fn test_per_call_connect_failure_names_slave() {
        let master = TcpRtuMaster::new(unreachable_config().keep_alive(false)).unwrap();
        master.init().unwrap();

        let err = master
            .send(&Request::read_holding_registers(9, 0, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert_eq!(err.slave_id(), Some(SlaveId(9)));
        assert!(!master.is_connected());
    }
}
