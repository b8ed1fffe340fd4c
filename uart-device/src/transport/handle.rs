//! Exclusive owner of one open port.

use futures::FutureExt;
use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, MutexGuard},
    time,
};
use tokio_util::sync::CancellationToken;

use super::{BoxedPort, Transport};
use crate::{
    config::{DeviceConfig, ReadTimeout},
    error::{IoError, OpenError},
    tracing::prelude::*,
};

/// An open port, split into a read half and a write half.
///
/// The halves are behind separate locks so one task can read while another
/// writes. A cancellation token lets [`close`](Self::close) interrupt
/// operations that are blocked on the port, so closing never waits for
/// traffic.
pub struct TransportHandle {
    port_name: String,
    reader: Mutex<Option<ReadHalf<BoxedPort>>>,
    writer: Mutex<Option<WriteHalf<BoxedPort>>>,
    open: AtomicBool,
    io_cancel: CancellationToken,
}

impl TransportHandle {
    /// Validate `config` and open the port through `transport`.
    pub async fn open(
        transport: &dyn Transport,
        config: &DeviceConfig,
    ) -> Result<Self, OpenError> {
        config.validate()?;

        debug!(
            port = %config.path,
            transport = transport.name(),
            baud_rate = config.baud_rate,
            data_bits = %config.data_bits,
            parity = %config.parity,
            stop_bits = %config.stop_bits,
            flow_control = %config.flow_control,
            "Opening port"
        );

        let port = transport.open(config).await.inspect_err(|e| {
            warn!(port = %config.path, error = %e, "Failed to open port");
        })?;
        let (reader, writer) = tokio::io::split(port);

        info!(port = %config.path, baud_rate = config.baud_rate, "Port opened");

        Ok(Self {
            port_name: config.path.clone(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
            io_cancel: CancellationToken::new(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Release the port.
    ///
    /// Outstanding reads and writes are cancelled first and fail with
    /// `ChannelClosed`; once this returns the OS resource has been dropped.
    /// Closing a closed handle does nothing.
    pub async fn close(&self) {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        self.io_cancel.cancel();

        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        drop((reader, writer));

        if was_open {
            info!(port = %self.port_name, "Port closed");
        }
    }

    /// Synchronous close for drop paths.
    ///
    /// A half that is locked by an in-flight operation is released when that
    /// operation, already cancelled, lets go of the handle.
    pub(crate) fn close_now(&self) {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        self.io_cancel.cancel();

        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        if was_open {
            debug!(port = %self.port_name, "Port released on drop");
        }
    }

    /// Stop all current and future I/O without releasing the port.
    ///
    /// Used after a hardware fault: the device keeps the handle until it is
    /// explicitly disconnected.
    pub(crate) fn interrupt(&self) {
        self.io_cancel.cancel();
    }

    /// Read into `buf` following the `timeout` policy.
    pub async fn read(&self, buf: &mut [u8], timeout: ReadTimeout) -> Result<usize, IoError> {
        let mut guard = self.lock_io(&self.reader).await?;
        let reader = guard.as_mut().ok_or(IoError::ChannelClosed)?;

        if buf.is_empty() {
            return Ok(0);
        }

        let result = match timeout {
            ReadTimeout::NonBlocking => match reader.read(buf).now_or_never() {
                Some(result) => result,
                None => return Ok(0),
            },
            ReadTimeout::Infinite => tokio::select! {
                biased;
                _ = self.io_cancel.cancelled() => return Err(IoError::ChannelClosed),
                result = reader.read(buf) => result,
            },
            ReadTimeout::After(limit) => tokio::select! {
                biased;
                _ = self.io_cancel.cancelled() => return Err(IoError::ChannelClosed),
                result = time::timeout(limit, reader.read(buf)) => match result {
                    Ok(result) => result,
                    Err(_) => {
                        trace!(
                            port = %self.port_name,
                            timeout_ms = limit.as_millis(),
                            "Timeout waiting for data"
                        );
                        return Err(IoError::Timeout);
                    }
                },
            },
        };

        match result {
            // Serial lines have no end of stream; the far side went away.
            Ok(0) => Err(self.fault("read", "end of stream")),
            Ok(n) => {
                trace!(port = %self.port_name, bytes = n, data = ?&buf[..n], "Received data");
                Ok(n)
            }
            Err(e) => Err(self.classify("read", e)),
        }
    }

    /// Write some prefix of `bytes`, returning how much was accepted.
    pub async fn write(&self, bytes: &[u8], timeout: Option<Duration>) -> Result<usize, IoError> {
        let mut guard = self.lock_io(&self.writer).await?;
        let writer = guard.as_mut().ok_or(IoError::ChannelClosed)?;

        if bytes.is_empty() {
            return Ok(0);
        }

        let result = tokio::select! {
            biased;
            _ = self.io_cancel.cancelled() => return Err(IoError::ChannelClosed),
            result = with_deadline(timeout, writer.write(bytes)) => result,
        };

        match result {
            None => {
                trace!(port = %self.port_name, "Timeout waiting for write");
                Err(IoError::Timeout)
            }
            Some(Ok(0)) => Err(self.fault("write", "port accepted no bytes")),
            Some(Ok(n)) => {
                trace!(port = %self.port_name, bytes = n, data = ?&bytes[..n], "Sent data");
                Ok(n)
            }
            Some(Err(e)) => Err(self.classify("write", e)),
        }
    }

    /// Push buffered output to the port.
    ///
    /// On the serial backend this is `tcdrain(3)`, which blocks the calling
    /// worker thread until the UART has sent everything. Neither the write
    /// timeout nor [`close`](Self::close) can interrupt it; with hardware
    /// flow control held off it may not return at all. Plain writes do not
    /// need it.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<(), IoError> {
        let mut guard = self.lock_io(&self.writer).await?;
        let writer = guard.as_mut().ok_or(IoError::ChannelClosed)?;

        let result = tokio::select! {
            biased;
            _ = self.io_cancel.cancelled() => return Err(IoError::ChannelClosed),
            result = with_deadline(timeout, writer.flush()) => result,
        };

        match result {
            None => Err(IoError::Timeout),
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(self.classify("flush", e)),
        }
    }

    async fn lock_io<'a, T>(
        &'a self,
        slot: &'a Mutex<Option<T>>,
    ) -> Result<MutexGuard<'a, Option<T>>, IoError> {
        if self.io_cancel.is_cancelled() {
            return Err(IoError::ChannelClosed);
        }
        tokio::select! {
            biased;
            _ = self.io_cancel.cancelled() => Err(IoError::ChannelClosed),
            guard = slot.lock() => Ok(guard),
        }
    }

    fn classify(&self, operation: &'static str, e: io::Error) -> IoError {
        if e.kind() == io::ErrorKind::TimedOut {
            return IoError::Timeout;
        }
        self.fault(operation, &e.to_string())
    }

    fn fault(&self, operation: &'static str, reason: &str) -> IoError {
        error!(port = %self.port_name, operation, error = %reason, "Port failed");
        IoError::HardwareFault(reason.to_string())
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if self.is_open() {
            debug!(port = %self.port_name, "TransportHandle dropped, closing port");
        }
    }
}

async fn with_deadline<F: std::future::Future>(
    timeout: Option<Duration>,
    future: F,
) -> Option<F::Output> {
    match timeout {
        Some(limit) => time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::Arc;

    const PORT: &str = "/dev/ttyLOOP0";

    async fn open_handle(transport: &LoopbackTransport, config: &DeviceConfig) -> TransportHandle {
        transport.add_port(PORT);
        TransportHandle::open(transport, config).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config_before_touching_port() {
        let transport = LoopbackTransport::new();
        transport.add_port(PORT);
        let config = DeviceConfig::new(PORT, 1234);

        let err = TransportHandle::open(&transport, &config).await.err().unwrap();
        assert!(matches!(err, OpenError::InvalidConfig(_)));
        assert!(!transport.is_held(PORT));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_port() {
        let transport = LoopbackTransport::new();
        let handle = open_handle(&transport, &DeviceConfig::new(PORT, 9600)).await;
        assert!(handle.is_open());
        assert!(transport.is_held(PORT));

        handle.close().await;
        assert!(!handle.is_open());
        assert!(!transport.is_held(PORT));

        handle.close().await;
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_io_after_close_reports_channel_closed() {
        let transport = LoopbackTransport::new();
        let handle = open_handle(&transport, &DeviceConfig::new(PORT, 9600)).await;
        handle.close().await;

        let mut buf = [0u8; 4];
        assert_eq!(
            handle.read(&mut buf, ReadTimeout::NonBlocking).await,
            Err(IoError::ChannelClosed)
        );
        assert_eq!(handle.write(b"x", None).await, Err(IoError::ChannelClosed));
        assert_eq!(handle.flush(None).await, Err(IoError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_non_blocking_read_with_nothing_buffered() {
        let transport = LoopbackTransport::new();
        let handle = open_handle(&transport, &DeviceConfig::new(PORT, 9600)).await;
        let _peer = transport.take_peer(PORT).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf, ReadTimeout::NonBlocking).await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_read_times_out() {
        let transport = LoopbackTransport::new();
        let handle = open_handle(&transport, &DeviceConfig::new(PORT, 9600)).await;
        let _peer = transport.take_peer(PORT).unwrap();

        let mut buf = [0u8; 4];
        let result = handle
            .read(&mut buf, ReadTimeout::After(Duration::from_millis(50)))
            .await;
        assert_eq!(result, Err(IoError::Timeout));
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn test_close_cancels_blocked_read() {
        let transport = LoopbackTransport::new();
        let handle = Arc::new(open_handle(&transport, &DeviceConfig::new(PORT, 9600)).await);
        let _peer = transport.take_peer(PORT).unwrap();

        let reader = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                handle.read(&mut buf, ReadTimeout::Infinite).await
            })
        };
        tokio::task::yield_now().await;

        time::timeout(Duration::from_secs(5), handle.close())
            .await
            .expect("close must not wait for the blocked read");
        let result = time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("read must finish after close")
            .unwrap();
        assert_eq!(result, Err(IoError::ChannelClosed));
        assert!(!transport.is_held(PORT));
    }

    #[tokio::test]
    async fn test_peer_gone_is_hardware_fault() {
        let transport = LoopbackTransport::new();
        let handle = open_handle(&transport, &DeviceConfig::new(PORT, 9600)).await;
        drop(transport.take_peer(PORT).unwrap());

        let mut buf = [0u8; 4];
        let result = handle.read(&mut buf, ReadTimeout::Infinite).await;
        assert!(matches!(result, Err(IoError::HardwareFault(_))));
    }

    #[tokio::test]
    async fn test_interrupt_keeps_port_held() {
        let transport = LoopbackTransport::new();
        let handle = open_handle(&transport, &DeviceConfig::new(PORT, 9600)).await;

        handle.interrupt();
        assert_eq!(handle.write(b"x", None).await, Err(IoError::ChannelClosed));
        assert!(transport.is_held(PORT));

        handle.close().await;
        assert!(!transport.is_held(PORT));
    }
}
