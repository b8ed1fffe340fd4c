//! Stream endpoints.
//!
//! [`InputStream`] and [`OutputStream`] are views over whatever port the
//! owning [`Device`](crate::device::Device) currently holds. They own
//! nothing themselves: every operation looks up the device's handle and
//! fails with [`IoError::ChannelClosed`] unless the device is connected.
//! One task may read while another writes.

use std::sync::Arc;

use crate::{device::Link, error::IoError};

/// Read side of a device.
#[derive(Clone)]
pub struct InputStream {
    link: Arc<Link>,
}

impl InputStream {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Read available bytes into `buf`.
    ///
    /// Waits according to the device's
    /// [`ReadTimeout`](crate::config::ReadTimeout). Returns `Ok(0)` only for
    /// an empty `buf` or a non-blocking poll that found nothing.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let handle = self.link.active_handle()?;
        let result = handle.read(buf, self.link.config().read_timeout).await;
        if let Err(e) = &result {
            self.link.record_io_error(&handle, e);
        }
        result
    }

    /// Whether reads can currently succeed.
    pub fn is_open(&self) -> bool {
        self.link.is_connected()
    }
}

/// Write side of a device.
#[derive(Clone)]
pub struct OutputStream {
    link: Arc<Link>,
}

impl OutputStream {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Write a prefix of `bytes` and return its length, which may be short
    /// when the port applies backpressure.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, IoError> {
        let handle = self.link.active_handle()?;
        let result = handle.write(bytes, self.link.config().write_timeout).await;
        if let Err(e) = &result {
            self.link.record_io_error(&handle, e);
        }
        result
    }

    /// Write all of `bytes`.
    ///
    /// On error, an unknown prefix may already have been sent.
    pub async fn write_all(&self, mut bytes: &[u8]) -> Result<(), IoError> {
        while !bytes.is_empty() {
            let n = self.write(bytes).await?;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Flush anything the transport has buffered.
    ///
    /// Blocks a runtime worker on serial ports; see
    /// [`TransportHandle::flush`](crate::transport::TransportHandle::flush).
    pub async fn flush(&self) -> Result<(), IoError> {
        let handle = self.link.active_handle()?;
        let result = handle.flush(self.link.config().write_timeout).await;
        if let Err(e) = &result {
            self.link.record_io_error(&handle, e);
        }
        result
    }

    /// Whether writes can currently succeed.
    pub fn is_open(&self) -> bool {
        self.link.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeviceConfig, ReadTimeout},
        device::{Device, DeviceState},
        registry::Registry,
        transport::LoopbackTransport,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PORT: &str = "/dev/ttyVIRT1";

    async fn connected(config: DeviceConfig, capacity: usize) -> (Arc<LoopbackTransport>, Device) {
        let transport = Arc::new(LoopbackTransport::with_capacity(capacity));
        transport.add_port(PORT);
        let mut device = Registry::with_transport(transport.clone())
            .acquire(config)
            .unwrap();
        device.connect().await.unwrap();
        (transport, device)
    }

    #[tokio::test]
    async fn test_endpoints_closed_before_connect() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_port(PORT);
        let registry = Registry::with_transport(transport.clone());
        let device = registry.acquire(DeviceConfig::new(PORT, 9600)).unwrap();

        let input = device.input_stream();
        let output = device.output_stream();
        assert!(!input.is_open());
        assert!(!output.is_open());

        let mut buf = [0u8; 1];
        assert_eq!(input.read(&mut buf).await, Err(IoError::ChannelClosed));
        assert_eq!(output.write(b"x").await, Err(IoError::ChannelClosed));
        assert_eq!(output.flush().await, Err(IoError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_empty_buffers_are_not_errors() {
        let (_transport, device) = connected(DeviceConfig::new(PORT, 9600), 64).await;
        let mut empty = [0u8; 0];
        assert_eq!(device.input_stream().read(&mut empty).await, Ok(0));
        assert_eq!(device.output_stream().write(&[]).await, Ok(0));
    }

    #[tokio::test]
    async fn test_write_all_crosses_small_pipe() {
        let (transport, device) = connected(DeviceConfig::new(PORT, 9600), 4).await;
        let mut peer = transport.take_peer(PORT).unwrap();
        let output = device.output_stream();

        let payload: Vec<u8> = (0u8..32).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move { output.write_all(&payload).await });

        let mut received = vec![0u8; 32];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(writer.await.unwrap(), Ok(()));
        assert_eq!(received, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_under_backpressure() {
        let config = DeviceConfig::new(PORT, 9600).with_write_timeout(Duration::from_millis(20));
        let (transport, device) = connected(config, 4).await;
        let _peer = transport.take_peer(PORT).unwrap();
        let output = device.output_stream();

        assert_eq!(output.write(b"abcdef").await, Ok(4));
        assert_eq!(output.write(b"ef").await, Err(IoError::Timeout));
        assert!(device.is_connected());
    }

    #[tokio::test]
    async fn test_non_blocking_read_policy() {
        let config = DeviceConfig::new(PORT, 9600).with_read_timeout(ReadTimeout::NonBlocking);
        let (transport, device) = connected(config, 64).await;
        let mut peer = transport.take_peer(PORT).unwrap();
        let input = device.input_stream();

        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).await, Ok(0));

        peer.write_all(b"ok").await.unwrap();
        assert_eq!(input.read(&mut buf).await, Ok(2));
        assert_eq!(&buf[..2], b"ok");
    }

    #[tokio::test]
    async fn test_concurrent_read_and_write() {
        let config = DeviceConfig::new(PORT, 9600).with_read_timeout(ReadTimeout::Infinite);
        let (transport, device) = connected(config, 64).await;
        let mut peer = transport.take_peer(PORT).unwrap();
        let input = device.input_stream();
        let output = device.output_stream();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = input.read(&mut buf).await?;
            Ok::<_, IoError>(buf[..n].to_vec())
        });
        // The reader is parked on the port; writes must still go through.
        output.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert!(!got.is_empty());
        assert!(b"pong".starts_with(&got));
    }

    #[tokio::test]
    async fn test_write_fault_fails_device() {
        let (transport, device) = connected(DeviceConfig::new(PORT, 9600), 64).await;
        drop(transport.take_peer(PORT).unwrap());
        let output = device.output_stream();

        let result = output.write(b"x").await;
        assert!(matches!(result, Err(IoError::HardwareFault(_))));
        assert_eq!(device.state(), DeviceState::Failed);
        assert_eq!(output.write(b"x").await, Err(IoError::ChannelClosed));
    }
}
