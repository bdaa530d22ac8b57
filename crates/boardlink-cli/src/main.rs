//! `boardlink` — run scripts on a MicroPython-compatible board.
//!
//! Builds the payload queue (inline command first, then script files in
//! order), opens a session to the board, and streams the board's output to
//! stdout. Driver-level errors go to stderr; a traceback from the board
//! itself is written to stdout, as the board produced it.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use boardlink_core::protocol::{self, list_ports, ProtocolError, Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(
    name = "boardlink",
    version,
    about = "Run scripts on MicroPython-compatible boards"
)]
struct Args {
    /// Serial device, or the IP address of a telnet-bridged board
    #[arg(long, default_value = "/dev/ttyACM0")]
    device: String,

    /// Baud rate of the serial device
    #[arg(short, long, default_value_t = protocol::DEFAULT_BAUD_RATE)]
    baudrate: u32,

    /// Telnet login username
    #[arg(short, long, default_value = "micro")]
    user: String,

    /// Telnet login password
    #[arg(short, long, default_value = "python")]
    password: String,

    /// Program passed in as a string
    #[arg(short, long)]
    command: Option<String>,

    /// Seconds to wait for a USB-connected board to become available
    #[arg(short, long, default_value_t = 0)]
    wait: u32,

    /// Keep streaming board output after the scripts finish
    /// [default if no scripts are given]
    #[arg(long)]
    follow: bool,

    /// List candidate serial devices and exit
    #[arg(long)]
    list: bool,

    /// Script files to run, in order
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if args.list {
        for port in list_ports() {
            match port.product {
                Some(product) => println!("{} ({product})", port.name),
                None => println!("{}", port.name),
            }
        }
        return ExitCode::SUCCESS;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ProtocolError>() {
                // The board's own traceback is the report; it goes to
                // stdout like the rest of the board's output
                Some(ProtocolError::ExecutionFault { stderr, .. }) => {
                    write_console(stderr);
                }
                _ => eprintln!("boardlink: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    if let Some(command) = &args.command {
        payloads.push(command.clone().into_bytes());
    }
    for file in &args.files {
        let program = std::fs::read(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        payloads.push(program);
    }

    let config = SessionConfig {
        device: args.device,
        baud_rate: args.baudrate,
        user: args.user,
        password: args.password,
        wait_seconds: args.wait,
        ..Default::default()
    };

    let mut session = Session::open(config)?;
    let mut sink = |chunk: &[u8]| write_console(chunk);
    let result = protocol::run(&mut session, &payloads, args.follow, None, &mut sink);
    session.close();
    result.map_err(Into::into)
}

/// Write board output to stdout with the EOT delimiters stripped
fn write_console(bytes: &[u8]) {
    let cleaned: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|&byte| byte != protocol::EOT[0])
        .collect();
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(&cleaned);
    let _ = stdout.flush();
}
