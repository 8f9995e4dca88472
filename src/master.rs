//! The fieldbus master: connection lifecycle and request dispatch.
//!
//! # Architecture
//!
//! ```text
//! caller ──► TcpRtuMaster::send ──► ConnectionSupervisor ──► ExchangeCoordinator
//!            (one lock per master)   (open with backoff,       (submit frame,
//!                                     best-effort close)        wait for reply)
//! ```
//!
//! Two connection modes exist:
//!
//! - **Persistent** (`keep_alive = true`): `init` opens the connection and
//!   every `send` reuses it. A failed exchange is followed by exactly one
//!   reopen + resubmit.
//! - **Per-call** (`keep_alive = false`): every `send` opens a fresh
//!   connection and closes it again on every exit path. No recovery.
//!
//! Secondary errors (cleanup failures, the first failure of a recovered
//! exchange) go to a [`DiagnosticSink`]; the caller only ever sees the
//! terminal outcome.
//!
//! # Usage
//!
//! ```ignore
//! use tcprtu::{MasterConfig, Request, TcpRtuMaster};
//!
//! let master = TcpRtuMaster::new(MasterConfig::new("192.168.1.20", 502))?;
//! master.init()?;
//! let reply = master.send(&Request::read_holding_registers(1, 0, 10))?;
//! master.destroy();
//! ```

mod connection;
mod dispatcher;
mod error;

pub use connection::{ConnectionStats, ConnectionSupervisor};
pub use dispatcher::{MasterBuilder, TcpRtuMaster};
pub use error::{
    CleanupStage, ConnectError, DiagnosticSink, ErrorKind, MasterError, TracingSink,
};
