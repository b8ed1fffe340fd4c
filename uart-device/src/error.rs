//! Error types for uart-device.
//!
//! Each layer has its own small taxonomy: [`OpenError`] for acquiring a port,
//! [`IoError`] for traffic on an open port, and [`AcquireError`] for the
//! registry. OS-level failures are translated into these at the transport
//! boundary; callers never see raw OS codes. [`Error`] wraps all of them for
//! the device lifecycle operations.

use thiserror::Error;

use crate::device::DeviceState;

/// Failure to open a serial port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// The path does not name an existing device.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The OS refused access to the device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Another holder already owns the device.
    #[error("device busy: {0}")]
    Busy(String),

    /// The line settings are not supported by the transport.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The transport failed in a way none of the other variants describe.
    #[error("open failed: {0}")]
    Other(String),
}

/// Failure of a read or write on a stream endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The device is not connected, or was disconnected while the operation
    /// was in flight.
    #[error("channel closed")]
    ChannelClosed,

    /// The configured deadline elapsed before any byte was transferred.
    #[error("timed out")]
    Timeout,

    /// The transport failed underneath an open port (device unplugged,
    /// end of stream, I/O error). Moves the device to `Failed`.
    #[error("hardware fault: {0}")]
    HardwareFault(String),
}

impl IoError {
    /// Whether this error takes the device out of the `Connected` state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IoError::HardwareFault(_))
    }
}

/// Failure to acquire a device from the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// A live device already holds this physical port.
    #[error("port already open: {0}")]
    AlreadyOpen(String),
}

/// Main error type for device lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    /// The operation is not allowed in the device's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: DeviceState,
    },

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_display() {
        let e = OpenError::NotFound("/dev/ttyUSB9".into());
        assert_eq!(e.to_string(), "device not found: /dev/ttyUSB9");

        let e = OpenError::InvalidConfig("baud rate 12345 is not a standard rate".into());
        assert_eq!(
            e.to_string(),
            "invalid configuration: baud rate 12345 is not a standard rate"
        );
    }

    #[test]
    fn test_only_hardware_faults_are_fatal() {
        assert!(IoError::HardwareFault("unplugged".into()).is_fatal());
        assert!(!IoError::Timeout.is_fatal());
        assert!(!IoError::ChannelClosed.is_fatal());
    }

    #[test]
    fn test_wrapped_errors_are_transparent() {
        let e: Error = IoError::ChannelClosed.into();
        assert_eq!(e.to_string(), "channel closed");

        let e: Error = AcquireError::AlreadyOpen("/dev/ttyS0".into()).into();
        assert_eq!(e.to_string(), "port already open: /dev/ttyS0");
    }

    #[test]
    fn test_invalid_state_display() {
        let e = Error::InvalidState {
            operation: "connect",
            state: DeviceState::Failed,
        };
        assert_eq!(e.to_string(), "cannot connect while failed");
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + std::error::Error>() {}
        assert_send_sync::<Error>();
        assert_send_sync::<OpenError>();
        assert_send_sync::<IoError>();
    }
}
