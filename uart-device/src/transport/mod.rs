//! Physical transport layer for serial devices.
//!
//! This module handles low-level connections to serial ports: opening and
//! releasing the OS resource, advisory availability probes, and raw byte
//! stream access without any protocol knowledge.
//!
//! A [`Transport`] is a backend. Two exist: [`SerialTransport`] for real
//! UARTs, USB-to-serial adapters and pseudo terminals, and
//! [`LoopbackTransport`], an in-memory backend whose far end is handed to
//! the test or simulator driving it. Opening a port through a backend
//! yields a [`TransportHandle`], which owns the resource exclusively.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{config::DeviceConfig, error::OpenError};

pub mod handle;
pub mod loopback;
pub mod serial;

pub use handle::TransportHandle;
pub use loopback::LoopbackTransport;
pub use serial::SerialTransport;

/// A bidirectional byte stream for an open port.
pub trait Port: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Port for T {}

/// An opened port, type-erased over the backend.
pub type BoxedPort = Box<dyn Port>;

/// A serial transport backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for log messages.
    fn name(&self) -> &'static str;

    /// Identifier of the physical port behind `path`.
    ///
    /// The registry keys ownership on this, so two paths that reach the
    /// same hardware must map to the same identifier.
    fn port_id(&self, path: &str) -> String {
        path.to_string()
    }

    /// Advisory check that the port exists and could be opened.
    ///
    /// Must not open or otherwise take ownership of the port. The answer
    /// can be stale by the time a caller acts on it.
    fn probe(&self, config: &DeviceConfig) -> bool;

    /// Open the port with the configured line settings.
    ///
    /// On error nothing may remain acquired.
    async fn open(&self, config: &DeviceConfig) -> Result<BoxedPort, OpenError>;
}
