//! Event-multiplexed transport driven by a tokio runtime.
//!
//! The socket is registered with the runtime's reactor; reading happens in a
//! task spawned on that runtime as soon as a consumer is registered, so there
//! is no separate start step. Writes are issued from the caller's thread via
//! [`Handle::block_on`].
//!
//! The runtime must be multi-threaded (or otherwise driven elsewhere), and
//! [`Transport::write`] must not be called from inside one of its tasks.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{DataConsumer, Transport};

/// Size of the reader task's receive buffer.
const READ_BUFFER_SIZE: usize = 1024;

type ConsumerSlot = Arc<Mutex<Option<Arc<dyn DataConsumer>>>>;

/// Transport whose reads are multiplexed on a tokio runtime.
pub struct MultiplexedTransport {
    runtime: Handle,
    /// Read half, moved into the reader task on first `set_consumer()`.
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    consumer: ConsumerSlot,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MultiplexedTransport {
    /// Register `stream` with the reactor behind `runtime`.
    ///
    /// Switches the socket (and every clone of it) to non-blocking mode.
    pub fn new(stream: TcpStream, runtime: Handle) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let stream = {
            let _guard = runtime.enter();
            tokio::net::TcpStream::from_std(stream)?
        };
        let (reader, writer) = stream.into_split();

        Ok(Self {
            runtime,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            consumer: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Check if the reader task is still active.
    pub fn is_reading(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Transport for MultiplexedTransport {
    fn set_consumer(&self, consumer: Arc<dyn DataConsumer>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        *self.consumer.lock() = Some(consumer);

        if let Some(reader) = self.reader.lock().take() {
            let slot = Arc::clone(&self.consumer);
            *self.task.lock() = Some(self.runtime.spawn(read_loop(reader, slot)));
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is closed",
            ));
        }
        self.runtime.block_on(async {
            let mut writer = self.writer.lock().await;
            writer.write_all(data).await?;
            writer.flush().await
        })
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.consumer.lock().take();
        self.reader.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for MultiplexedTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, slot: ConsumerSlot) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let result = reader.read(&mut buf).await;

        // Closed locally while we were waiting.
        let Some(consumer) = slot.lock().clone() else {
            break;
        };

        match result {
            Ok(0) => {
                consumer.terminated(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by gateway",
                ));
                break;
            }
            Ok(n) => consumer.data(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                consumer.terminated(e);
                break;
            }
        }
    }

    debug!("Multiplexed reader task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{socket_pair, Recorder};
    use std::io::{Read, Write};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Failed to build runtime")
    }

    #[test]
    fn test_roundtrip_through_runtime() {
        let rt = runtime();
        let (client, mut server) = socket_pair();
        let transport = MultiplexedTransport::new(client, rt.handle().clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        transport.set_consumer(recorder.clone());

        transport.write(&[0x01, 0x02]).unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x02]);

        server.write_all(&[0x03]).unwrap();
        assert!(recorder.wait_for(WAIT, |r| r.bytes == vec![0x03]));
        assert!(transport.is_reading());

        transport.close().unwrap();
    }

    #[test]
    fn test_peer_close_reports_termination() {
        let rt = runtime();
        let (client, server) = socket_pair();
        let transport = MultiplexedTransport::new(client, rt.handle().clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        transport.set_consumer(recorder.clone());

        drop(server);

        assert!(recorder.wait_for(WAIT, |r| r.terminated.is_some()));
    }

    #[test]
    fn test_write_after_close_fails() {
        let rt = runtime();
        let (client, _server) = socket_pair();
        let transport = MultiplexedTransport::new(client, rt.handle().clone()).unwrap();

        transport.close().unwrap();
        transport.close().unwrap();

        let err = transport.write(&[0x00]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(!transport.is_reading());
    }
}
