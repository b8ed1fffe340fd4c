//! In-memory transport backend.
//!
//! Ports are registered by path. Each open creates a fresh in-memory pipe:
//! the device gets one end, and the other end (the "peer") waits in the
//! transport until a test or simulator picks it up with
//! [`LoopbackTransport::take_peer`]. Dropping the peer looks to the device
//! like the hardware disappearing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use super::{BoxedPort, Transport};
use crate::{config::DeviceConfig, error::OpenError};

/// Default pipe capacity in each direction.
const DEFAULT_CAPACITY: usize = 4096;

/// Virtual serial ports backed by in-memory pipes.
pub struct LoopbackTransport {
    ports: Mutex<HashMap<String, Slot>>,
    capacity: usize,
}

struct Slot {
    accessible: bool,
    held: Arc<AtomicBool>,
    peer: Option<DuplexStream>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a transport whose pipes buffer at most `capacity` bytes per
    /// direction. Writers block once the peer stops draining.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Make a port appear at `path`.
    pub fn add_port(&self, path: &str) {
        self.ports.lock().entry(path.to_string()).or_insert_with(|| Slot {
            accessible: true,
            held: Arc::new(AtomicBool::new(false)),
            peer: None,
        });
    }

    /// Make the port at `path` disappear. A device holding it keeps its
    /// pipe until the peer is dropped.
    pub fn remove_port(&self, path: &str) -> bool {
        self.ports.lock().remove(path).is_some()
    }

    /// Allow or refuse opening the port, as file permissions would.
    pub fn set_accessible(&self, path: &str, accessible: bool) {
        if let Some(slot) = self.ports.lock().get_mut(path) {
            slot.accessible = accessible;
        }
    }

    /// Take the far end of the most recent open of `path`.
    pub fn take_peer(&self, path: &str) -> Option<DuplexStream> {
        self.ports.lock().get_mut(path).and_then(|slot| slot.peer.take())
    }

    /// Whether some device currently holds the port open.
    pub fn is_held(&self, path: &str) -> bool {
        self.ports
            .lock()
            .get(path)
            .is_some_and(|slot| slot.held.load(Ordering::Acquire))
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn probe(&self, config: &DeviceConfig) -> bool {
        self.ports
            .lock()
            .get(&config.path)
            .is_some_and(|slot| slot.accessible)
    }

    async fn open(&self, config: &DeviceConfig) -> Result<BoxedPort, OpenError> {
        let mut ports = self.ports.lock();
        let slot = ports
            .get_mut(&config.path)
            .ok_or_else(|| OpenError::NotFound(config.path.clone()))?;

        if !slot.accessible {
            return Err(OpenError::PermissionDenied(config.path.clone()));
        }
        if slot.held.swap(true, Ordering::AcqRel) {
            return Err(OpenError::Busy(config.path.clone()));
        }

        let (near, far) = tokio::io::duplex(self.capacity);
        slot.peer = Some(far);

        Ok(Box::new(LoopbackPort {
            inner: near,
            held: slot.held.clone(),
        }))
    }
}

/// The device's end of a loopback pipe.
struct LoopbackPort {
    inner: DuplexStream,
    held: Arc<AtomicBool>,
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

impl AsyncRead for LoopbackPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for LoopbackPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
