//! Scripted fake serial-to-TCP gateway for integration tests.
//!
//! The gateway answers RTU requests over real localhost sockets:
//!
//! - read holding/input registers: register `i` holds `start + i`
//! - write single register, write multiple registers: normal echo replies
//! - anything else: exception code 0x01
//! - broadcast (slave 0): no reply
//!
//! Each accepted connection follows the next [`Behavior`] of the script;
//! once the script is exhausted connections are served normally.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tcprtu::rtu::crc16;

/// What the gateway does on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer every request.
    Serve,
    /// Answer this many requests, then close the connection.
    DropAfter(usize),
    /// Read requests but never answer.
    Mute,
}

#[derive(Debug, Default)]
pub struct GatewayStats {
    accepts: AtomicUsize,
    peer_closes: AtomicUsize,
    requests: AtomicUsize,
    /// (request received, reply written) per answered request.
    spans: Mutex<Vec<(Instant, Instant)>>,
}

pub struct FakeGateway {
    addr: SocketAddr,
    stats: Arc<GatewayStats>,
}

impl FakeGateway {
    /// Serve every connection normally.
    pub fn start() -> Self {
        Self::scripted(Vec::new(), Duration::ZERO)
    }

    /// Follow `script` connection by connection, delaying each reply.
    pub fn scripted(script: Vec<Behavior>, reply_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind gateway");
        Self::run(listener, script, reply_delay)
    }

    /// Serve normally on a fixed address.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self::run(listener, Vec::new(), Duration::ZERO))
    }

    fn run(listener: TcpListener, script: Vec<Behavior>, reply_delay: Duration) -> Self {
        let addr = listener.local_addr().expect("Failed to read gateway address");
        let stats = Arc::new(GatewayStats::default());
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let accept_stats = Arc::clone(&stats);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    continue;
                };
                accept_stats.accepts.fetch_add(1, Ordering::SeqCst);
                let behavior = script.lock().pop_front().unwrap_or(Behavior::Serve);
                let stats = Arc::clone(&accept_stats);
                thread::spawn(move || serve(stream, behavior, reply_delay, &stats));
            }
        });

        Self { addr, stats }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn accepts(&self) -> usize {
        self.stats.accepts.load(Ordering::SeqCst)
    }

    /// Connections the master closed.
    pub fn peer_closes(&self) -> usize {
        self.stats.peer_closes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.stats.requests.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        self.stats.spans.lock().clone()
    }
}

/// Poll `done` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

/// A port nothing listens on.
pub fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    listener.local_addr().expect("Failed to read address")
}

fn serve(mut stream: TcpStream, behavior: Behavior, reply_delay: Duration, stats: &GatewayStats) {
    let mut answered = 0usize;

    if behavior == Behavior::DropAfter(0) {
        return;
    }

    loop {
        let Some(request) = read_request(&mut stream) else {
            stats.peer_closes.fetch_add(1, Ordering::SeqCst);
            return;
        };
        let received = Instant::now();
        stats.requests.fetch_add(1, Ordering::SeqCst);

        if behavior == Behavior::Mute || request[0] == 0 {
            continue;
        }

        thread::sleep(reply_delay);
        let reply = respond(&request);
        stats.spans.lock().push((received, Instant::now()));
        if stream.write_all(&reply).is_err() {
            return;
        }
        answered += 1;

        if behavior == Behavior::DropAfter(answered) {
            return;
        }
    }
}

/// Read one RTU request frame; `None` once the master hangs up.
fn read_request(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut frame = vec![0u8; 2];
    stream.read_exact(&mut frame).ok()?;

    let rest = match frame[1] {
        0x0F | 0x10 => {
            let mut header = [0u8; 5];
            stream.read_exact(&mut header).ok()?;
            frame.extend_from_slice(&header);
            header[4] as usize + 2
        }
        _ => 6,
    };

    let mut tail = vec![0u8; rest];
    stream.read_exact(&mut tail).ok()?;
    frame.extend_from_slice(&tail);
    Some(frame)
}

fn respond(request: &[u8]) -> Vec<u8> {
    let (slave, function) = (request[0], request[1]);
    let word = |at: usize| u16::from_be_bytes([request[at], request[at + 1]]);

    let mut reply = vec![slave];
    match function {
        0x03 | 0x04 => {
            let (start, count) = (word(2), word(4));
            reply.push(function);
            reply.push((count * 2) as u8);
            for i in 0..count {
                reply.extend_from_slice(&start.wrapping_add(i).to_be_bytes());
            }
        }
        0x06 => reply.extend_from_slice(&request[1..6]),
        0x10 => reply.extend_from_slice(&request[1..6]),
        other => {
            reply.push(other | 0x80);
            reply.push(0x01);
        }
    }

    let crc = crc16(&reply);
    reply.extend_from_slice(&crc.to_le_bytes());
    reply
}
