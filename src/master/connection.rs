//! Lifecycle of the single gateway connection owned by a master.
//!
//! A connection handle bundles the TCP endpoint, the transport built on it
//! and the exchange coordinator bound to that transport. At most one handle
//! exists at a time; [`ConnectionSupervisor::open`] always closes the previous
//! one first.

use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::error::{CleanupStage, ConnectError, DiagnosticSink, MasterError, TracingSink};
use crate::backoff::{BackoffPolicy, RetryDecision};
use crate::config::{IpParameters, MasterConfig};
use crate::exchange::{ExchangeCoordinator, ExchangeError, FrameListener, KeyStrategy};
use crate::rtu::{Frame, FrameCodec, SerialKeys};
use crate::transport::{ignore_not_connected, GatewayTransport};

/// Name of the reader thread of threaded transports.
const READER_THREAD_NAME: &str = "tcprtu-reader";

/// Waits between connection attempts.
pub(crate) type PauseFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Establishes the stream endpoint for one connection attempt.
type DialFn = Arc<dyn Fn(&IpParameters, Duration) -> io::Result<TcpStream> + Send + Sync>;

/// Shuts the stream endpoint down during cleanup.
type ShutdownFn = fn(&TcpStream) -> io::Result<()>;

/// Lifetime counters of one supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Connections successfully opened.
    pub connects: u64,
    /// Individual connection attempts that failed.
    pub connect_failures: u64,
    /// Connections closed.
    pub closes: u64,
    /// Recovery procedures started after a failed exchange.
    pub recoveries: u64,
}

struct ConnectionHandle<C: FrameCodec> {
    id: u64,
    stream: TcpStream,
    coordinator: ExchangeCoordinator<C, GatewayTransport>,
}

/// Opens, tracks and closes the gateway connection.
pub struct ConnectionSupervisor<C: FrameCodec> {
    target: IpParameters,
    timeout: Duration,
    backoff: BackoffPolicy,
    multiplexer: Option<Handle>,
    codec: Arc<C>,
    keys: Arc<dyn KeyStrategy>,
    listener: Option<Arc<dyn FrameListener>>,
    sink: Arc<dyn DiagnosticSink>,
    pause: PauseFn,
    dial: DialFn,
    shutdown: ShutdownFn,
    handle: Option<ConnectionHandle<C>>,
    stats: ConnectionStats,
    generation: u64,
}

impl<C: FrameCodec> ConnectionSupervisor<C> {
    /// Supervisor for `config.target` using the threaded transport, serial
    /// correlation keys and the tracing sink.
    pub fn new(config: &MasterConfig, codec: Arc<C>) -> Self {
        Self {
            target: config.target.clone(),
            timeout: config.timeout_duration(),
            backoff: config.backoff_policy(),
            multiplexer: None,
            codec,
            keys: Arc::new(SerialKeys),
            listener: None,
            sink: Arc::new(TracingSink),
            pause: Arc::new(thread::sleep),
            dial: Arc::new(dial),
            shutdown: shutdown_endpoint,
            handle: None,
            stats: ConnectionStats::default(),
            generation: 0,
        }
    }

    /// Use the multiplexed transport driven by `runtime`.
    pub fn with_multiplexer(mut self, runtime: Option<Handle>) -> Self {
        self.multiplexer = runtime;
        self
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_listener(mut self, listener: Option<Arc<dyn FrameListener>>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the wait between connection attempts (defaults to a sleep).
    pub fn with_pause(mut self, pause: Arc<dyn Fn(Duration) + Send + Sync>) -> Self {
        self.pause = pause;
        self
    }

    #[cfg(test)]
    fn with_dial(mut self, dial: DialFn) -> Self {
        self.dial = dial;
        self
    }

    #[cfg(test)]
    fn with_shutdown(mut self, shutdown: ShutdownFn) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Open a fresh connection, retrying with backoff.
    ///
    /// Any live connection is closed first. Returns the id of the new
    /// connection; ids increase with every successful open.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt once the retry budget is spent.
    pub fn open(&mut self) -> Result<u64, ConnectError> {
        self.close();

        let mut attempt = 0u32;
        loop {
            match self.connect_once() {
                Ok(handle) => {
                    self.generation = handle.id;
                    self.stats.connects += 1;
                    info!(
                        "Connected to gateway {} (connection {}, {} transport)",
                        self.target,
                        handle.id,
                        handle.coordinator.transport().kind()
                    );
                    self.handle = Some(handle);
                    return Ok(self.generation);
                }
                Err(e) => {
                    self.stats.connect_failures += 1;
                    match self.backoff.next(attempt) {
                        RetryDecision::RetryAfter(delay) => {
                            debug!(
                                "Connect attempt {} to {} failed: {} - retrying in {}ms",
                                attempt + 1,
                                self.target,
                                e,
                                delay.as_millis()
                            );
                            (self.pause)(delay);
                            attempt += 1;
                        }
                        RetryDecision::GiveUp => {
                            return Err(ConnectError {
                                target: self.target.to_string(),
                                attempts: attempt + 1,
                                source: e,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Close the live connection, if any.
    ///
    /// The coordinator and its transport are stopped before the endpoint is
    /// shut down. Failures of either step go to the diagnostic sink; neither
    /// prevents the other.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        debug!("Closing gateway connection {}", handle.id);
        self.release(handle);
        self.stats.closes += 1;
    }

    /// Submit `frame` on the live connection.
    pub fn submit(&self, frame: &Frame) -> Result<Option<Frame>, ExchangeError> {
        match &self.handle {
            Some(handle) => handle.coordinator.submit(frame),
            None => Err(ExchangeError::Stopped),
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Id of the live connection.
    pub fn connection_id(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.id)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub(crate) fn record_recovery(&mut self) {
        self.stats.recoveries += 1;
    }

    pub(crate) fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    /// One connection attempt, including transport and coordinator setup.
    fn connect_once(&self) -> io::Result<ConnectionHandle<C>> {
        let stream = (self.dial)(&self.target, self.timeout)?;
        let transport = GatewayTransport::make(&stream, self.multiplexer.as_ref())?;
        let coordinator = ExchangeCoordinator::start(
            transport,
            Arc::clone(&self.codec),
            self.listener.clone(),
            Arc::clone(&self.keys),
            self.timeout,
        );
        let handle = ConnectionHandle {
            id: self.generation + 1,
            stream,
            coordinator,
        };

        if let Err(e) = handle.coordinator.transport().start(READER_THREAD_NAME) {
            self.release(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Tear a handle down, reporting every failure.
    fn release(&self, handle: ConnectionHandle<C>) {
        let shutdown = self.shutdown;
        run_cleanup(
            self.sink.as_ref(),
            || handle.coordinator.stop(),
            || shutdown(&handle.stream),
        );
    }
}

/// Stop the transport, then shut the endpoint down.
///
/// Both steps always run. Each failure is reported to `sink` as a
/// `MasterError::Cleanup`, in step order.
fn run_cleanup<T, E>(sink: &dyn DiagnosticSink, stop_transport: T, shutdown_endpoint: E)
where
    T: FnOnce() -> io::Result<()>,
    E: FnOnce() -> io::Result<()>,
{
    let mut failures = Vec::new();

    if let Err(source) = stop_transport() {
        failures.push(MasterError::Cleanup {
            stage: CleanupStage::Transport,
            source,
        });
    }
    if let Err(source) = shutdown_endpoint() {
        failures.push(MasterError::Cleanup {
            stage: CleanupStage::Endpoint,
            source,
        });
    }

    for failure in &failures {
        sink.report(failure);
    }
}

fn shutdown_endpoint(stream: &TcpStream) -> io::Result<()> {
    ignore_not_connected(stream.shutdown(Shutdown::Both))
}

/// Resolve `target` and connect to the first address that answers.
///
/// Connect, read and write are all bounded by `timeout`.
fn dial(target: &IpParameters, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;

    for addr in target.resolve()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", target))
    }))
}

impl<C: FrameCodec> Drop for ConnectionSupervisor<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: FrameCodec> fmt::Debug for ConnectionSupervisor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .field("multiplexed", &self.multiplexer.is_some())
            .field("connection", &self.connection_id())
            .field("stats", &self.stats)
            .finish()
    }
}
