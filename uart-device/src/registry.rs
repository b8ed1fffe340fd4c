//! Registry of devices by physical port.
//!
//! The registry hands out [`Device`]s and guarantees that at most one live
//! device exists per physical port at a time. It is an ordinary value: create
//! one at startup and pass it (or clones of it, which share state) to
//! whoever needs devices.

use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use crate::{
    config::DeviceConfig,
    device::Device,
    error::AcquireError,
    tracing::prelude::*,
    transport::{LoopbackTransport, SerialTransport, Transport},
};

/// Hands out devices for one transport backend.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    claimed: Mutex<HashSet<String>>,
}

impl Registry {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    /// Create a registry over a shared backend, e.g. a
    /// [`LoopbackTransport`](crate::transport::LoopbackTransport) the caller
    /// keeps a reference to.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                claimed: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Registry for real serial ports.
    pub fn serial() -> Self {
        Self::new(SerialTransport::new())
    }

    /// Registry over a fresh in-memory backend, returned alongside it so
    /// the caller can add ports and pick up peers.
    pub fn loopback() -> (Self, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        (Self::with_transport(transport.clone()), transport)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Create the device for `config.path`.
    ///
    /// Fails if a live device already holds the same physical port. The
    /// entry is held until the device is released or dropped; acquiring does
    /// not open the port.
    pub fn acquire(&self, config: DeviceConfig) -> Result<Device, AcquireError> {
        let port_id = self.inner.transport.port_id(&config.path);

        if !self.inner.claimed.lock().insert(port_id.clone()) {
            warn!(port = %config.path, port_id = %port_id, "Port already claimed");
            return Err(AcquireError::AlreadyOpen(config.path));
        }

        debug!(port = %config.path, port_id = %port_id, "Port claimed");
        let lease = Lease {
            registry: Arc::downgrade(&self.inner),
            port_id,
        };
        Ok(Device::new(config, self.inner.transport.clone(), lease))
    }

    /// Disconnect `device` and free its port for the next acquire.
    pub async fn release(&self, mut device: Device) {
        device.disconnect().await;
        drop(device);
    }

    /// Whether a live device holds the port behind `path`.
    pub fn is_claimed(&self, path: &str) -> bool {
        let port_id = self.inner.transport.port_id(path);
        self.inner.claimed.lock().contains(&port_id)
    }

    /// Identifiers of all claimed ports, sorted.
    pub fn claimed(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.inner.claimed.lock().iter().cloned().collect();
        ports.sort();
        ports
    }
}

/// A device's claim on its registry entry; dropping it frees the entry.
pub(crate) struct Lease {
    registry: Weak<RegistryInner>,
    port_id: String,
}

impl Lease {
    pub(crate) fn port_id(&self) -> &str {
        &self.port_id
    }

    /// Move the claim to `port_id`, which `path` now resolves to.
    ///
    /// A link acquired while its target was missing is keyed on the link
    /// itself; once the target appears the claim must follow it, or another
    /// device could be acquired for the same node under its real name.
    pub(crate) fn rekey(&mut self, path: &str, port_id: String) -> Result<(), AcquireError> {
        if port_id == self.port_id {
            return Ok(());
        }
        if let Some(registry) = self.registry.upgrade() {
            let mut claimed = registry.claimed.lock();
            if claimed.contains(&port_id) {
                warn!(port = %path, port_id = %port_id, "Port resolves to a claimed port");
                return Err(AcquireError::AlreadyOpen(path.to_string()));
            }
            claimed.remove(&self.port_id);
            claimed.insert(port_id.clone());
        }
        debug!(port = %path, from = %self.port_id, to = %port_id, "Port claim moved");
        self.port_id = port_id;
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.claimed.lock().remove(&self.port_id);
            debug!(port_id = %self.port_id, "Port unclaimed");
        }
    }
}
