//! Serial port devices with an explicit connection lifecycle.
//!
//! A [`Registry`] hands out one [`Device`] per physical port. A device is
//! connected and disconnected by its owner and exposes an [`InputStream`]
//! and an [`OutputStream`] that carry raw bytes while it is connected and
//! fail with [`IoError::ChannelClosed`] otherwise. Framing, protocols and
//! retry policy belong to the caller.
//!
//! ```no_run
//! use uart_device::{DeviceConfig, Registry};
//!
//! # async fn example() -> uart_device::Result<()> {
//! let registry = Registry::serial();
//! let mut device = registry.acquire(DeviceConfig::new("/dev/ttyUSB0", 115200))?;
//! device.connect().await?;
//!
//! device.output_stream().write_all(b"AT\r").await?;
//! let mut buf = [0u8; 64];
//! let n = device.input_stream().read(&mut buf).await?;
//! println!("{:?}", &buf[..n]);
//!
//! device.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod registry;
pub mod stream;
pub mod tracing;
pub mod transport;

pub use config::{DataBits, DeviceConfig, FlowControl, Parity, ReadTimeout, StopBits};
pub use device::{Device, DeviceState};
pub use error::{AcquireError, Error, IoError, OpenError, Result};
pub use registry::Registry;
pub use stream::{InputStream, OutputStream};
pub use transport::{LoopbackTransport, SerialTransport, Transport, TransportHandle};
