//! Master error taxonomy and the diagnostic sink for secondary errors.

use std::fmt;
use std::io;

use thiserror::Error;
use tracing::warn;

use crate::exchange::ExchangeError;
use crate::models::SlaveId;

/// Coarse classification used to drive recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The stream endpoint could not be established.
    Connect,
    /// An exchange failed on a persistent connection; recovery follows.
    TransientExchange,
    /// An exchange failed and no recovery is left.
    TerminalExchange,
    /// Closing a transport or endpoint failed.
    Cleanup,
    /// The master is not initialized.
    NotInitialized,
}

impl ErrorKind {
    /// Get a short display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connect => "connect",
            ErrorKind::TransientExchange => "transient exchange",
            ErrorKind::TerminalExchange => "terminal exchange",
            ErrorKind::Cleanup => "cleanup",
            ErrorKind::NotInitialized => "not initialized",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All connection attempts to the gateway failed.
///
/// `source` is the error of the final attempt.
#[derive(Debug, Error)]
#[error("failed to connect to {target} after {attempts} attempt(s): {source}")]
pub struct ConnectError {
    pub target: String,
    pub attempts: u32,
    #[source]
    pub source: io::Error,
}

/// Which cleanup step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStage {
    /// Stopping the exchange coordinator and its transport.
    Transport,
    /// Shutting down the stream endpoint.
    Endpoint,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStage::Transport => f.write_str("transport"),
            CleanupStage::Endpoint => f.write_str("endpoint"),
        }
    }
}

/// Errors surfaced by [`crate::TcpRtuMaster`] or reported to its sink.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("master is not initialized")]
    NotInitialized,

    /// Eager connect during `init` failed.
    #[error("initialization failed: {0}")]
    Init(#[source] ConnectError),

    #[error("slave {slave_id}: {source}")]
    Connect {
        slave_id: SlaveId,
        #[source]
        source: ConnectError,
    },

    #[error("slave {slave_id}: exchange failed, reconnecting: {source}")]
    TransientExchange {
        slave_id: SlaveId,
        #[source]
        source: ExchangeError,
    },

    #[error("slave {slave_id}: {source}")]
    TerminalExchange {
        slave_id: SlaveId,
        #[source]
        source: ExchangeError,
    },

    #[error("failed to close {stage}: {source}")]
    Cleanup {
        stage: CleanupStage,
        #[source]
        source: io::Error,
    },
}

impl MasterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MasterError::NotInitialized => ErrorKind::NotInitialized,
            MasterError::Init(_) | MasterError::Connect { .. } => ErrorKind::Connect,
            MasterError::TransientExchange { .. } => ErrorKind::TransientExchange,
            MasterError::TerminalExchange { .. } => ErrorKind::TerminalExchange,
            MasterError::Cleanup { .. } => ErrorKind::Cleanup,
        }
    }

    /// Device the failed request was addressed to, if any.
    pub fn slave_id(&self) -> Option<SlaveId> {
        match self {
            MasterError::Connect { slave_id, .. }
            | MasterError::TransientExchange { slave_id, .. }
            | MasterError::TerminalExchange { slave_id, .. } => Some(*slave_id),
            _ => None,
        }
    }
}

/// Receives secondary errors that are never returned to the caller.
///
/// Reports are fire-and-forget and may come from any thread calling into the
/// master. Closures of type `Fn(&MasterError)` are sinks too.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, error: &MasterError);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&MasterError) + Send + Sync,
{
    fn report(&self, error: &MasterError) {
        self(error)
    }
}

/// Default sink: logs every report at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, error: &MasterError) {
        warn!(kind = %error.kind(), "{}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn connect_error() -> ConnectError {
        ConnectError {
            target: "10.0.0.1:502".to_string(),
            attempts: 3,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(MasterError::NotInitialized.kind(), ErrorKind::NotInitialized);
        assert_eq!(MasterError::Init(connect_error()).kind(), ErrorKind::Connect);

        let err = MasterError::TerminalExchange {
            slave_id: SlaveId(3),
            source: ExchangeError::Stopped,
        };
        assert_eq!(err.kind(), ErrorKind::TerminalExchange);
        assert_eq!(err.slave_id(), Some(SlaveId(3)));

        let err = MasterError::Cleanup {
            stage: CleanupStage::Endpoint,
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert_eq!(err.kind(), ErrorKind::Cleanup);
        assert_eq!(err.slave_id(), None);
    }

    #[test]
    fn test_connect_error_display_names_device() {
        let err = MasterError::Connect {
            slave_id: SlaveId(7),
            source: connect_error(),
        };
        let text = err.to_string();
        assert!(text.starts_with("slave 7: failed to connect to 10.0.0.1:502 after 3 attempt(s)"));
    }

    #[test]
    fn test_timeout_display() {
        let err = MasterError::TerminalExchange {
            slave_id: SlaveId(1),
            source: ExchangeError::Timeout {
                key: crate::exchange::CorrelationKey::new(SlaveId(1), 3),
                timeout: Duration::from_millis(500),
            },
        };
        assert_eq!(
            err.to_string(),
            "slave 1: no response for slave 1 fc 0x03 within 500ms"
        );
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |e: &MasterError| seen.lock().push(e.kind());

        sink.report(&MasterError::NotInitialized);
        assert_eq!(*seen.lock(), vec![ErrorKind::NotInitialized]);
    }
}
