//! Byte-stream transports between the master and a gateway.
//!
//! A transport writes bytes on the caller's thread and pushes received bytes
//! to a registered [`DataConsumer`]. Two variants exist:
//!
//! ```text
//! ┌────────────────────┐  dedicated reader thread  ┌─────────────┐
//! │ StreamTransport    │ ─────────────────────────►│             │
//! └────────────────────┘   (explicit start step)   │ DataConsumer│
//! ┌────────────────────┐  task on a tokio runtime  │ (exchange)  │
//! │ MultiplexedTransport│ ────────────────────────►│             │
//! └────────────────────┘   (driven by the runtime) └─────────────┘
//! ```
//!
//! [`GatewayTransport`] is the tagged union picked once per connection.

mod multiplexed;
mod stream;

use std::io;
use std::net::TcpStream;
use std::sync::Arc;

use tokio::runtime::Handle;

pub use multiplexed::MultiplexedTransport;
pub use stream::StreamTransport;

/// Receives bytes read from a transport.
pub trait DataConsumer: Send + Sync {
    /// Bytes arrived from the peer.
    fn data(&self, bytes: &[u8]);

    /// The stream ended (peer closed, reset, or read error).
    ///
    /// Not called when the transport is closed locally.
    fn terminated(&self, reason: io::Error);
}

/// Write/close capability over one stream connection.
pub trait Transport: Send + Sync {
    /// Register the consumer for inbound bytes, replacing any previous one.
    fn set_consumer(&self, consumer: Arc<dyn DataConsumer>);

    /// Write all of `data` to the peer.
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Stop reading and release transport resources. Idempotent.
    ///
    /// Does not close the underlying socket; that belongs to whoever opened it.
    fn close(&self) -> io::Result<()>;
}

/// Transport chosen for one gateway connection.
pub enum GatewayTransport {
    /// Blocking I/O with a dedicated reader thread.
    Threaded(StreamTransport),
    /// Non-blocking I/O driven by a tokio runtime.
    Multiplexed(MultiplexedTransport),
}

impl GatewayTransport {
    /// Build a transport over `stream`.
    ///
    /// With a runtime handle the multiplexed variant is used, otherwise the
    /// dedicated-thread variant. `stream` itself stays with the caller.
    pub fn make(stream: &TcpStream, multiplexer: Option<&Handle>) -> io::Result<Self> {
        match multiplexer {
            Some(runtime) => Ok(GatewayTransport::Multiplexed(MultiplexedTransport::new(
                stream.try_clone()?,
                runtime.clone(),
            )?)),
            None => Ok(GatewayTransport::Threaded(StreamTransport::new(
                stream.try_clone()?,
                stream.try_clone()?,
            )?)),
        }
    }

    /// Start reading. Only the threaded variant needs this step.
    pub fn start(&self, name: &str) -> io::Result<()> {
        match self {
            GatewayTransport::Threaded(transport) => transport.start(name),
            GatewayTransport::Multiplexed(_) => Ok(()),
        }
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayTransport::Threaded(_) => "threaded",
            GatewayTransport::Multiplexed(_) => "multiplexed",
        }
    }
}

impl Transport for GatewayTransport {
    fn set_consumer(&self, consumer: Arc<dyn DataConsumer>) {
        match self {
            GatewayTransport::Threaded(t) => t.set_consumer(consumer),
            GatewayTransport::Multiplexed(t) => t.set_consumer(consumer),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        match self {
            GatewayTransport::Threaded(t) => t.write(data),
            GatewayTransport::Multiplexed(t) => t.write(data),
        }
    }

    fn close(&self) -> io::Result<()> {
        match self {
            GatewayTransport::Threaded(t) => t.close(),
            GatewayTransport::Multiplexed(t) => t.close(),
        }
    }
}

/// Treat "socket already gone" as success when shutting a socket down.
pub(crate) fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for transport tests.

    use std::io;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use parking_lot::{Condvar, Mutex};

    use super::DataConsumer;

    /// Connected (client, server) socket pair on localhost.
    pub fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to read local addr");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, _) = listener.accept().expect("Failed to accept");
        (client, server)
    }

    /// Consumer that records everything it is given.
    #[derive(Default)]
    pub struct Recorder {
        state: Mutex<Recorded>,
        changed: Condvar,
    }

    #[derive(Default)]
    pub struct Recorded {
        pub bytes: Vec<u8>,
        pub terminated: Option<io::ErrorKind>,
    }

    impl Recorder {
        /// Wait until `done` holds or `timeout` elapses; returns whether it held.
        pub fn wait_for(&self, timeout: Duration, done: impl Fn(&Recorded) -> bool) -> bool {
            let deadline = std::time::Instant::now() + timeout;
            let mut state = self.state.lock();
            while !done(&state) {
                if self.changed.wait_until(&mut state, deadline).timed_out() {
                    return done(&state);
                }
            }
            true
        }

        pub fn bytes(&self) -> Vec<u8> {
            self.state.lock().bytes.clone()
        }

        pub fn terminated(&self) -> Option<io::ErrorKind> {
            self.state.lock().terminated
        }
    }

    impl DataConsumer for Recorder {
        fn data(&self, bytes: &[u8]) {
            self.state.lock().bytes.extend_from_slice(bytes);
            self.changed.notify_all();
        }

        fn terminated(&self, reason: io::Error) {
            self.state.lock().terminated = Some(reason.kind());
            self.changed.notify_all();
        }
    }
}
