//! Serial port transport over `tokio-serial`.
//!
//! Covers on-board UARTs, USB virtual COM ports (`/dev/ttyUSB*`,
//! `/dev/ttyACM*`) and pseudo terminals. Ports are opened exclusively
//! (`TIOCEXCL`), so a second open from another process fails with `Busy`.

use async_trait::async_trait;
use rustix::{
    fs::{access, Access},
    io::Errno,
};
use std::io;
use tokio_serial::SerialPortBuilderExt;

use super::{BoxedPort, Transport};
use crate::{
    config::{DataBits, DeviceConfig, FlowControl, Parity, StopBits},
    error::OpenError,
    tracing::prelude::*,
};

/// Backend for real serial devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTransport;

impl SerialTransport {
    pub fn new() -> Self {
        SerialTransport
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    /// Resolve symlinks such as `/dev/serial/by-id/...` so that every name
    /// for one device node maps to the same identifier.
    fn port_id(&self, path: &str) -> String {
        std::fs::canonicalize(path)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    fn probe(&self, config: &DeviceConfig) -> bool {
        match check_access(&config.path) {
            Ok(()) => true,
            Err(e) => {
                trace!(port = %config.path, error = %e, "Port not available");
                false
            }
        }
    }

    async fn open(&self, config: &DeviceConfig) -> Result<BoxedPort, OpenError> {
        let stop_bits = tokio_serial::StopBits::try_from(config.stop_bits)?;
        check_access(&config.path)?;

        let stream = tokio_serial::new(&config.path, config.baud_rate)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(stop_bits)
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                error!(port = %config.path, error = %e, "Failed to open serial port");
                map_serial_error(&config.path, e)
            })?;

        Ok(Box::new(stream))
    }
}

/// Check that `path` exists and is readable and writable by us, without
/// opening it.
fn check_access(path: &str) -> Result<(), OpenError> {
    access(path, Access::READ_OK | Access::WRITE_OK).map_err(|errno| match errno {
        Errno::NOENT | Errno::NOTDIR | Errno::NODEV | Errno::NXIO => {
            OpenError::NotFound(path.to_string())
        }
        Errno::ACCESS | Errno::PERM | Errno::ROFS => OpenError::PermissionDenied(path.to_string()),
        other => OpenError::Other(format!("{}: {}", path, other)),
    })
}

fn map_serial_error(path: &str, e: tokio_serial::Error) -> OpenError {
    use tokio_serial::ErrorKind;

    // A failed TIOCEXCL lock arrives as NoDevice; check the description
    // before trusting the kind.
    let description = e.description.to_ascii_lowercase();
    if description.contains("exclusive lock") || description.contains("busy") {
        return OpenError::Busy(path.to_string());
    }

    match e.kind {
        ErrorKind::NoDevice | ErrorKind::Io(io::ErrorKind::NotFound) => {
            OpenError::NotFound(path.to_string())
        }
        ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            OpenError::PermissionDenied(path.to_string())
        }
        ErrorKind::Io(io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock) => {
            OpenError::Busy(path.to_string())
        }
        ErrorKind::InvalidInput => {
            OpenError::InvalidConfig(format!("{}: {}", path, e.description))
        }
        _ => OpenError::Other(format!("{}: {}", path, e.description)),
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl TryFrom<StopBits> for tokio_serial::StopBits {
    type Error = OpenError;

    fn try_from(bits: StopBits) -> Result<Self, Self::Error> {
        match bits {
            StopBits::One => Ok(tokio_serial::StopBits::One),
            StopBits::Two => Ok(tokio_serial::StopBits::Two),
            StopBits::OnePointFive => Err(OpenError::InvalidConfig(
                "1.5 stop bits are not supported by serial ports".to_string(),
            )),
        }
    }
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}
