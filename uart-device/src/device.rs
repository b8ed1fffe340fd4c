//! Device lifecycle.
//!
//! A [`Device`] owns at most one [`TransportHandle`] and drives it through
//! a small state machine:
//!
//! ```text
//!   Disconnected --connect--> Connecting --ok----> Connected
//!                                 |                    |  \
//!                                 +--error--> Failed <-+   disconnect
//!                                               |          |
//!                                          disconnect      v
//!                                               +----> Disconnecting --> Disconnected
//! ```
//!
//! `Failed` is left only through [`Device::disconnect`]; the core never
//! retries on its own. A hardware fault on either stream endpoint moves a
//! connected device to `Failed`. Neither backend can see an unplug out of
//! band, so the fault is discovered by the next read or write; observers of
//! [`Device::watch_state`] are told as soon as that happens.

use parking_lot::{Mutex, RwLock};
use std::{fmt, sync::Arc};
use strum::Display;
use tokio::sync::watch;

use crate::{
    config::DeviceConfig,
    error::{Error, IoError, Result},
    registry::Lease,
    stream::{InputStream, OutputStream},
    tracing::prelude::*,
    transport::{Transport, TransportHandle},
};

/// Lifecycle state of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// State shared between a device and its stream endpoints.
pub(crate) struct Link {
    config: DeviceConfig,
    state: watch::Sender<DeviceState>,
    handle: RwLock<Option<Arc<TransportHandle>>>,
    last_error: Mutex<Option<Error>>,
}

impl Link {
    fn new(config: DeviceConfig) -> Self {
        let (state, _) = watch::channel(DeviceState::Disconnected);
        Self {
            config,
            state,
            handle: RwLock::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    fn set_state(&self, next: DeviceState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(port = %self.config.path, from = %previous, to = %next, "State changed");
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == DeviceState::Connected
            && self.handle.read().as_ref().is_some_and(|h| h.is_open())
    }

    /// The handle to use for I/O, if the device is connected.
    pub(crate) fn active_handle(&self) -> std::result::Result<Arc<TransportHandle>, IoError> {
        if self.state() != DeviceState::Connected {
            return Err(IoError::ChannelClosed);
        }
        self.handle.read().clone().ok_or(IoError::ChannelClosed)
    }

    /// Record the outcome of an I/O error on `handle`.
    ///
    /// A fatal error on the current handle moves `Connected` to `Failed` and
    /// interrupts whatever the other endpoint is doing. Errors from a handle
    /// that has since been replaced or closed are ignored.
    pub(crate) fn record_io_error(&self, handle: &Arc<TransportHandle>, err: &IoError) {
        if !err.is_fatal() {
            return;
        }
        let is_current = self
            .handle
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if !is_current {
            return;
        }

        let failed = self.state.send_if_modified(|state| {
            if *state == DeviceState::Connected {
                *state = DeviceState::Failed;
                true
            } else {
                false
            }
        });
        if failed {
            warn!(port = %self.config.path, error = %err, "Device failed");
            *self.last_error.lock() = Some(err.clone().into());
            handle.interrupt();
        }
    }
}

/// A serial device obtained from a [`Registry`](crate::registry::Registry).
///
/// The owner drives the lifecycle (`connect`/`disconnect` take `&mut self`);
/// the stream endpoints may be cloned into other tasks. Dropping the device
/// releases the port and its registry entry.
pub struct Device {
    link: Arc<Link>,
    transport: Arc<dyn Transport>,
    input: InputStream,
    output: OutputStream,
    lease: Lease,
}

impl Device {
    pub(crate) fn new(config: DeviceConfig, transport: Arc<dyn Transport>, lease: Lease) -> Self {
        let link = Arc::new(Link::new(config));
        Self {
            input: InputStream::new(link.clone()),
            output: OutputStream::new(link.clone()),
            link,
            transport,
            lease,
        }
    }

    /// Open the port and move to `Connected`.
    ///
    /// Does nothing on a connected device. Fails with
    /// [`AcquireError::AlreadyOpen`](crate::error::AcquireError) if the path
    /// now resolves to a port another device holds. On failure the device
    /// is left in `Failed` with the error recorded, nothing stays acquired,
    /// and [`disconnect`](Self::disconnect) must be called before retrying.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state() {
            DeviceState::Disconnected => {}
            DeviceState::Connected => {
                debug!(port = %self.link.config.path, "Already connected");
                return Ok(());
            }
            state => {
                return Err(Error::InvalidState {
                    operation: "connect",
                    state,
                })
            }
        }

        // The path may resolve to a different node than it did at acquire.
        let port_id = self.transport.port_id(&self.link.config.path);
        if let Err(e) = self.lease.rekey(&self.link.config.path, port_id) {
            *self.link.last_error.lock() = Some(e.clone().into());
            self.link.set_state(DeviceState::Failed);
            return Err(e.into());
        }

        self.link.set_state(DeviceState::Connecting);

        match TransportHandle::open(self.transport.as_ref(), &self.link.config).await {
            Ok(handle) => {
                *self.link.handle.write() = Some(Arc::new(handle));
                *self.link.last_error.lock() = None;
                self.link.set_state(DeviceState::Connected);
                info!(port = %self.link.config.path, "Device connected");
                Ok(())
            }
            Err(e) => {
                *self.link.last_error.lock() = Some(e.clone().into());
                self.link.set_state(DeviceState::Failed);
                Err(e.into())
            }
        }
    }

    /// Release the port and return to `Disconnected`, whatever the current
    /// state.
    ///
    /// In-flight reads and writes fail with `ChannelClosed`; the port is
    /// released before this returns. Calling it again does nothing.
    pub async fn disconnect(&mut self) {
        let previous = self.state();
        if previous == DeviceState::Disconnected && self.link.handle.read().is_none() {
            trace!(port = %self.link.config.path, "Already disconnected");
            return;
        }

        self.link.set_state(DeviceState::Disconnecting);
        let handle = self.link.handle.write().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.link.set_state(DeviceState::Disconnected);

        info!(port = %self.link.config.path, from = %previous, "Device disconnected");
    }

    /// Whether the device is connected and its streams usable.
    ///
    /// Reflects cached state only; a fault that has not yet surfaced through
    /// a read or write is not seen here.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Whether the port exists and looks openable.
    ///
    /// Advisory only: the port is not opened or reserved, so a later
    /// [`connect`](Self::connect) can still fail (another process may open
    /// it first, or it may be unplugged in between).
    pub fn is_available(&self) -> bool {
        self.transport.probe(&self.link.config)
    }

    /// The read endpoint. Usable only while connected; clones refer to the
    /// same endpoint.
    pub fn input_stream(&self) -> InputStream {
        self.input.clone()
    }

    /// The write endpoint. Usable only while connected; clones refer to the
    /// same endpoint.
    pub fn output_stream(&self) -> OutputStream {
        self.output.clone()
    }

    pub fn state(&self) -> DeviceState {
        self.link.state()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.link.state.subscribe()
    }

    /// The error that last moved the device to `Failed`, if it has not been
    /// cleared by a successful connect.
    pub fn last_error(&self) -> Option<Error> {
        self.link.last_error.lock().clone()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.link.config
    }

    /// Identifier of the physical port this device holds in the registry.
    pub fn port_id(&self) -> &str {
        self.lease.port_id()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let handle = self.link.handle.write().take();
        if let Some(handle) = handle {
            handle.close_now();
        }
        self.link.set_state(DeviceState::Disconnected);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("port", &self.link.config.path)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish()
    }
}
