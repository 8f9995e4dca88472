//! tcprtu - fieldbus RTU master over TCP
//!
//! This library talks to serial-bus devices through a serial-to-TCP gateway,
//! sending RTU frames (address, PDU, CRC) over a plain TCP stream.
//!
//! - `master` - the public [`TcpRtuMaster`], connection lifecycle and recovery
//! - `backoff` - retry delays between connection attempts
//! - `config` - serde-loadable master configuration
//! - `models` - requests, responses and device addresses
//! - `rtu` - RTU framing and correlation keys
//! - `transport` - threaded and tokio-multiplexed byte transports
//! - `exchange` - request/response matching over one transport
//!
//! # Example
//!
//! ```ignore
//! use tcprtu::{MasterConfig, Request, TcpRtuMaster};
//!
//! let master = TcpRtuMaster::new(MasterConfig::new("192.168.1.20", 502))?;
//! master.init()?;
//! if let Some(reply) = master.send(&Request::read_holding_registers(1, 0, 4))? {
//!     println!("{:?}", reply.registers());
//! }
//! master.destroy();
//! ```

pub mod backoff;
pub mod config;
pub mod exchange;
pub mod master;
pub mod models;
pub mod rtu;
pub mod transport;

pub use config::{ConfigError, IpParameters, MasterConfig};
pub use master::{DiagnosticSink, ErrorKind, MasterBuilder, MasterError, TcpRtuMaster};
pub use models::{FunctionCode, Request, Response, SlaveId};
