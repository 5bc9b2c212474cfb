//! A live, claimed connection to the probe

use crate::config::CaptureConfig;
use crate::usb::classify::{ErrorClass, ErrorPolicy, Stage};
use crate::usb::transport::TransportHandle;
use common::ShutdownSignal;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Why [`DeviceSession::read_chunk`] returned no data
#[derive(Debug, Error)]
pub enum ReadError {
    /// The device is gone; the session is useless now
    #[error("Device disconnected")]
    DeviceLost,

    /// Any other transfer failure; the read may be retried
    #[error("Bulk transfer failed: {0}")]
    Transfer(#[source] rusb::Error),

    /// Shutdown was requested while polling an idle endpoint
    #[error("Read cancelled by shutdown")]
    Cancelled,
}

/// Open handle with the trace interface claimed
///
/// Releases the interface when dropped. The acquirer hands out at most one
/// of these at a time and the capture loop owns it exclusively.
pub struct DeviceSession<H: TransportHandle> {
    handle: H,
    interface: u8,
    endpoint: u8,
    timeout: Duration,
    buffer: Vec<u8>,
    bus_number: u8,
    address: u8,
    policy: ErrorPolicy,
}

impl<H: TransportHandle> DeviceSession<H> {
    /// Wrap a handle whose interface has already been claimed
    pub(crate) fn new(handle: H, config: &CaptureConfig, bus_number: u8, address: u8) -> Self {
        Self {
            handle,
            interface: config.device.interface,
            endpoint: config.device.endpoint,
            timeout: config.read_timeout(),
            buffer: vec![0u8; config.device.max_transfer_len],
            bus_number,
            address,
            policy: config.error_policy(),
        }
    }

    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Block until the endpoint delivers a chunk
    ///
    /// The returned slice holds exactly the bytes transferred and may be
    /// empty. With a zero read timeout this waits indefinitely; otherwise
    /// timeouts are treated as idle polls and only end the wait when
    /// `shutdown` has been triggered.
    pub fn read_chunk(&mut self, shutdown: &ShutdownSignal) -> Result<&[u8], ReadError> {
        let len = loop {
            match self
                .handle
                .read_bulk(self.endpoint, &mut self.buffer, self.timeout)
            {
                Ok(len) => break len,
                Err(rusb::Error::Timeout) if !self.timeout.is_zero() => {
                    if shutdown.is_triggered() {
                        return Err(ReadError::Cancelled);
                    }
                }
                Err(e) => {
                    return Err(match self.policy.classify(Stage::Read, &e) {
                        ErrorClass::Reacquire => ReadError::DeviceLost,
                        ErrorClass::Retry | ErrorClass::Fatal => ReadError::Transfer(e),
                    });
                }
            }
        };

        Ok(&self.buffer[..len])
    }
}

impl<H: TransportHandle> Drop for DeviceSession<H> {
    fn drop(&mut self) {
        match self.handle.release_interface(self.interface) {
            Ok(()) => debug!(
                "Released interface {} (bus {}, device {})",
                self.interface, self.bus_number, self.address
            ),
            // Expected when the device has already been unplugged
            Err(e) => debug!("Could not release interface {}: {}", self.interface, e),
        }
    }
}
