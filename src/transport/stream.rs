//! Blocking transport with a dedicated reader thread.
//!
//! The reader thread owns a clone of the socket and pushes every chunk it
//! reads to the registered consumer. The socket's read timeout only bounds how
//! long the thread sleeps between checks of the running flag; exchange
//! timeouts are enforced by the exchange coordinator.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{ignore_not_connected, DataConsumer, Transport};

/// Size of the reader thread's receive buffer.
const READ_BUFFER_SIZE: usize = 1024;

type ConsumerSlot = Arc<Mutex<Option<Arc<dyn DataConsumer>>>>;

/// Transport over a blocking `TcpStream` with its own reader thread.
///
/// Construction does not read anything; call [`StreamTransport::start`] once
/// a consumer is registered. Dropping the transport closes it.
pub struct StreamTransport {
    /// Read half, moved into the reader thread by `start()`.
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<TcpStream>,
    /// Clone used to unblock the reader thread on close.
    control: TcpStream,
    consumer: ConsumerSlot,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Wrap the read and write endpoints of one connection.
    pub fn new(read: TcpStream, write: TcpStream) -> io::Result<Self> {
        let control = read.try_clone()?;
        Ok(Self {
            reader: Mutex::new(Some(read)),
            writer: Mutex::new(write),
            control,
            consumer: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the reader thread.
    ///
    /// # Errors
    ///
    /// Fails if the transport was already started or closed, or if the
    /// thread cannot be spawned.
    pub fn start(&self, name: &str) -> io::Result<()> {
        let reader = self.reader.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "transport already started or closed")
        })?;

        self.running.store(true, Ordering::Release);
        let consumer = Arc::clone(&self.consumer);
        let running = Arc::clone(&self.running);

        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || reader_loop(reader, consumer, running));

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Check if the reader thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait briefly for the reader thread, then detach it if it is slow.
    fn join_worker(&self) {
        const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);
        const MAX_QUICK_CHECKS: u32 = 10;

        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        for _ in 0..MAX_QUICK_CHECKS {
            if handle.is_finished() {
                if let Err(e) = handle.join() {
                    warn!("Transport reader thread panicked: {:?}", e);
                }
                return;
            }
            thread::sleep(QUICK_CHECK_INTERVAL);
        }

        // The thread exits on its next wakeup; it no longer has a consumer.
        debug!(
            "Transport reader still running after {}ms - detaching",
            QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
        );
    }
}

impl Transport for StreamTransport {
    fn set_consumer(&self, consumer: Arc<dyn DataConsumer>) {
        *self.consumer.lock() = Some(consumer);
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()
    }

    fn close(&self) -> io::Result<()> {
        self.running.store(false, Ordering::Release);
        self.consumer.lock().take();
        self.reader.lock().take();

        let result = ignore_not_connected(self.control.shutdown(Shutdown::Read));
        self.join_worker();
        result
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Transport close on drop failed: {}", e);
        }
    }
}

fn reader_loop(mut stream: TcpStream, consumer: ConsumerSlot, running: Arc<AtomicBool>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    while running.load(Ordering::Acquire) {
        match stream.read(&mut buf) {
            Ok(0) => {
                notify_terminated(
                    &consumer,
                    &running,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by gateway"),
                );
                break;
            }
            Ok(n) => {
                let current = consumer.lock().clone();
                if let Some(current) = current {
                    current.data(&buf[..n]);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                notify_terminated(&consumer, &running, e);
                break;
            }
        }
    }

    debug!("Transport reader thread exiting");
}

fn notify_terminated(consumer: &ConsumerSlot, running: &AtomicBool, reason: io::Error) {
    // A local close already detached the consumer; nothing to report.
    if !running.swap(false, Ordering::AcqRel) {
        return;
    }
    let current = consumer.lock().clone();
    match current {
        Some(current) => current.terminated(reason),
        None => debug!("Transport terminated without consumer: {}", reason),
    }
}
