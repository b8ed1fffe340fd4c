//! Bridge a serial device to stdin/stdout.
//!
//! ```text
//! uart-cat <path> [baud] [parity]
//! uart-cat --config <file.json>
//! ```
//!
//! Bytes from the port go to stdout, bytes from stdin go to the port. Logs
//! go to stderr (or journald under systemd). Exits on SIGINT, SIGTERM or
//! end of stdin.

use anyhow::{bail, Context, Result};
use std::str::FromStr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    signal::unix::{self, SignalKind},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use uart_device::tracing::{self, prelude::*};
use uart_device::{DeviceConfig, InputStream, IoError, OutputStream, Parity, ReadTimeout, Registry};

const USAGE: &str = "usage: uart-cat <path> [baud] [parity] | uart-cat --config <file.json>";

fn parse_args(args: &[String]) -> Result<DeviceConfig> {
    match args {
        [flag, file] if flag == "--config" => {
            Ok(DeviceConfig::load_from(file).with_context(|| format!("loading {file}"))?)
        }
        [path, rest @ ..] if !path.starts_with('-') && rest.len() <= 2 => {
            let baud = match rest.first() {
                Some(baud) => baud.parse().with_context(|| format!("bad baud rate {baud:?}"))?,
                None => 115200,
            };
            let parity = match rest.get(1) {
                Some(parity) => {
                    Parity::from_str(parity).with_context(|| format!("bad parity {parity:?}"))?
                }
                None => Parity::None,
            };
            Ok(DeviceConfig::new(path.as_str(), baud)
                .with_parity(parity)
                .with_read_timeout(ReadTimeout::Infinite))
        }
        _ => bail!(USAGE),
    }
}

// Port to stdout until the channel closes.
async fn pump_port_to_stdout(input: InputStream) {
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 1024];
    loop {
        match input.read(&mut buf).await {
            Ok(n) => {
                if stdout.write_all(&buf[..n]).await.is_err() || stdout.flush().await.is_err() {
                    break;
                }
            }
            Err(IoError::Timeout) => continue,
            Err(IoError::ChannelClosed) => break,
            Err(e) => {
                error!(error = %e, "Read from port failed");
                break;
            }
        }
    }
    trace!("Port reader stopped.");
}

// Stdin to port until EOF, then signal shutdown.
async fn pump_stdin_to_port(output: OutputStream, running: CancellationToken) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::select! {
            _ = running.cancelled() => break,
            n = stdin.read(&mut buf) => match n {
                Ok(0) | Err(_) => {
                    running.cancel();
                    break;
                }
                Ok(n) => n,
            },
        };
        if let Err(e) = output.write_all(&buf[..n]).await {
            if e != IoError::ChannelClosed {
                error!(error = %e, "Write to port failed");
            }
            running.cancel();
            break;
        }
    }
    trace!("Stdin reader stopped.");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stderr();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args)?;

    let registry = Registry::serial();
    let mut device = registry.acquire(config)?;
    if !device.is_available() {
        warn!(port = %device.config().path, "Port does not look available, trying anyway.");
    }
    device
        .connect()
        .await
        .with_context(|| format!("connecting to {}", device.config().path))?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(pump_port_to_stdout(device.input_stream()));
    tracker.spawn(pump_stdin_to_port(device.output_stream(), running.clone()));
    tracker.close();
    info!("Started.");

    let mut states = device.watch_state();
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = running.cancelled() => {},
        _ = states.wait_for(|s| *s != uart_device::DeviceState::Connected) => {
            if let Some(e) = device.last_error() {
                error!(error = %e, "Device failed.");
            }
        },
    }

    trace!("Shutting down.");
    running.cancel();
    registry.release(device).await;

    // Stdin reads cannot be cancelled; do not wait on that task forever.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), tracker.wait()).await;
    info!("Exiting.");
    Ok(())
}
