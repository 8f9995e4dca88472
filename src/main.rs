//! tcprtu-probe - read holding registers through a serial-to-TCP gateway.
//!
//! ```text
//! tcprtu-probe <slave> <start> <count>
//! ```
//!
//! Configuration comes from the JSON file named by `TCPRTU_CONFIG` (if set),
//! overlaid with the `TCPRTU_*` environment variables. Set
//! `TCPRTU_MULTIPLEX=1` to drive the connection from a tokio runtime instead
//! of a dedicated reader thread.

use std::env;
use std::fs;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcprtu::{MasterConfig, Request, TcpRtuMaster};

const USAGE: &str = "usage: tcprtu-probe <slave> <start> <count>";

/// Destroys the master on every exit path.
struct MasterGuard<'a> {
    master: &'a TcpRtuMaster,
}

impl Drop for MasterGuard<'_> {
    fn drop(&mut self) {
        self.master.destroy();
    }
}

struct ProbeArgs {
    slave: u8,
    start: u16,
    count: u16,
}

fn parse_args() -> Result<ProbeArgs> {
    let args: Vec<String> = env::args().skip(1).collect();
    let [slave, start, count] = args.as_slice() else {
        bail!(USAGE);
    };

    Ok(ProbeArgs {
        slave: slave.parse().with_context(|| format!("invalid slave id {:?}", slave))?,
        start: start.parse().with_context(|| format!("invalid start address {:?}", start))?,
        count: count.parse().with_context(|| format!("invalid register count {:?}", count))?,
    })
}

fn load_config() -> Result<MasterConfig> {
    let base = match env::var_os("TCPRTU_CONFIG") {
        Some(path) => {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
            MasterConfig::from_json(&json)
                .with_context(|| format!("invalid config in {}", path.to_string_lossy()))?
        }
        None => MasterConfig::default(),
    };
    base.from_env().context("invalid TCPRTU_* environment")
}

fn run() -> Result<()> {
    let args = parse_args()?;
    let config = load_config()?;
    info!(
        "Probing slave {} at {} ({} registers from {})",
        args.slave, config.target, args.count, args.start
    );

    let runtime = match env::var("TCPRTU_MULTIPLEX").as_deref() {
        Ok("1") | Ok("true") => Some(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .context("failed to start tokio runtime")?,
        ),
        _ => None,
    };

    let mut builder = TcpRtuMaster::builder(config);
    if let Some(runtime) = &runtime {
        builder = builder.multiplexer(runtime.handle().clone());
    }
    let master = builder.build().context("invalid configuration")?;

    master.init().context("failed to initialize master")?;
    let _guard = MasterGuard { master: &master };

    let request = Request::read_holding_registers(args.slave, args.start, args.count);
    let response = master
        .send(&request)
        .with_context(|| format!("request to slave {} failed", args.slave))?;

    match response {
        None => println!("no response (broadcast)"),
        Some(response) if response.is_exception() => {
            bail!(
                "slave {} answered with exception code {:#04x}",
                args.slave,
                response.exception_code().unwrap_or_default()
            );
        }
        Some(response) => match response.registers() {
            Some(values) => {
                for (offset, value) in values.iter().enumerate() {
                    println!("{:>5}: {:>5} ({:#06x})", args.start as usize + offset, value, value);
                }
            }
            None => println!("{}", hex::encode(response.pdu())),
        },
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "tcprtu=info,tcprtu_probe=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
