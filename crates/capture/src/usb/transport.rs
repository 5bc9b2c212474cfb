//! Transport seam over libusb
//!
//! [`UsbTransport`] and [`TransportHandle`] are the only USB operations the
//! capture loop needs. Errors stay as [`rusb::Error`] so `NoDevice` can be
//! told apart from everything else (see [`crate::usb::classify`]).

use crate::usb::device::EnumeratedDevice;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::debug;

/// Lists and opens USB devices
pub trait UsbTransport {
    /// Opaque handle to a listed device
    type Device;
    /// Open connection to a device
    type Handle: TransportHandle;

    /// List every attached device in bus order
    fn list_devices(&self) -> rusb::Result<Vec<EnumeratedDevice<Self::Device>>>;

    /// Open a previously listed device
    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle>;
}

/// Operations on an open device
pub trait TransportHandle {
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool>;

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;

    /// Blocking bulk IN transfer
    ///
    /// A zero `timeout` waits forever. Returns the number of bytes written
    /// into `buf`, which may be zero.
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
}

/// Production transport backed by a libusb context
pub struct RusbTransport {
    context: Context,
}

impl RusbTransport {
    /// Initialize libusb
    pub fn new() -> rusb::Result<Self> {
        let context = Context::new()?;
        debug!("libusb context initialized");
        Ok(Self { context })
    }
}

impl UsbTransport for RusbTransport {
    type Device = Device<Context>;
    type Handle = DeviceHandle<Context>;

    fn list_devices(&self) -> rusb::Result<Vec<EnumeratedDevice<Self::Device>>> {
        // The DeviceList is freed when it goes out of scope; the collected
        // Device values hold their own references.
        let devices = self.context.devices()?;

        devices
            .iter()
            .map(|device| -> rusb::Result<EnumeratedDevice<Self::Device>> {
                let descriptor = device.device_descriptor()?;
                Ok(EnumeratedDevice {
                    vendor_id: descriptor.vendor_id(),
                    product_id: descriptor.product_id(),
                    bus_number: device.bus_number(),
                    address: device.address(),
                    device,
                })
            })
            .collect()
    }

    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle> {
        device.open()
    }
}

impl TransportHandle for DeviceHandle<Context> {
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool> {
        DeviceHandle::kernel_driver_active(self, interface)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::detach_kernel_driver(self, interface)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }
}
