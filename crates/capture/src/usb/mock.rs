//! Scripted in-memory transport for tests
//!
//! Lets acquisition and the capture loop be exercised without hardware.
//! Every call pops the next scripted result; once the script for listings
//! or reads runs dry the transport triggers the shutdown signal it was
//! given, so a loop under test always terminates.
//!
//! # Example
//!
//! ```
//! use capture::usb::mock::{MockDevice, MockTransport};
//! use capture::usb::UsbTransport;
//! use common::ShutdownSignal;
//!
//! let transport = MockTransport::new(ShutdownSignal::new());
//! transport.push_listing(vec![MockDevice::new(0x1d50, 0x6018, 1, 4)]);
//!
//! let devices = transport.list_devices().unwrap();
//! assert_eq!(devices[0].bus_number, 1);
//! ```

use crate::usb::device::EnumeratedDevice;
use crate::usb::transport::{TransportHandle, UsbTransport};
use common::ShutdownSignal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A device as it appears in a scripted listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    /// Whether a kernel driver reports as bound to the interface
    pub kernel_driver: bool,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16, bus_number: u8, address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number,
            address,
            kernel_driver: false,
        }
    }

    pub fn with_kernel_driver(mut self) -> Self {
        self.kernel_driver = true;
        self
    }
}

/// Something that happened on the mock, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Listed,
    Opened { bus_number: u8, address: u8 },
    DetachedKernelDriver(u8),
    Claimed(u8),
    Released(u8),
    Read(usize),
}

#[derive(Default)]
struct MockState {
    listings: VecDeque<rusb::Result<Vec<MockDevice>>>,
    open_results: VecDeque<rusb::Result<()>>,
    claim_results: VecDeque<rusb::Result<()>>,
    reads: VecDeque<rusb::Result<Vec<u8>>>,
    events: Vec<MockEvent>,
}

/// Transport whose behaviour is scripted up front
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    shutdown: ShutdownSignal,
}

impl MockTransport {
    /// `shutdown` is triggered once the listing or read script is exhausted
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the result of the next `list_devices` call
    pub fn push_listing(&self, devices: Vec<MockDevice>) -> &Self {
        self.lock().listings.push_back(Ok(devices));
        self
    }

    pub fn push_listing_error(&self, error: rusb::Error) -> &Self {
        self.lock().listings.push_back(Err(error));
        self
    }

    /// Queue the result of the next `open`; unscripted opens succeed
    pub fn push_open_result(&self, result: rusb::Result<()>) -> &Self {
        self.lock().open_results.push_back(result);
        self
    }

    /// Queue the result of the next `claim_interface`; unscripted claims succeed
    pub fn push_claim_result(&self, result: rusb::Result<()>) -> &Self {
        self.lock().claim_results.push_back(result);
        self
    }

    /// Queue a successful bulk read returning `data`
    pub fn push_read(&self, data: &[u8]) -> &Self {
        self.lock().reads.push_back(Ok(data.to_vec()));
        self
    }

    pub fn push_read_error(&self, error: rusb::Error) -> &Self {
        self.lock().reads.push_back(Err(error));
        self
    }

    /// Everything that happened so far
    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    /// Number of completed listings
    pub fn list_calls(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| **e == MockEvent::Listed)
            .count()
    }

    /// (bus, address) of every successfully opened device
    pub fn opened(&self) -> Vec<(u8, u8)> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Opened {
                    bus_number,
                    address,
                } => Some((*bus_number, *address)),
                _ => None,
            })
            .collect()
    }
}

impl UsbTransport for MockTransport {
    type Device = MockDevice;
    type Handle = MockHandle;

    fn list_devices(&self) -> rusb::Result<Vec<EnumeratedDevice<MockDevice>>> {
        let mut state = self.lock();
        let Some(listing) = state.listings.pop_front() else {
            self.shutdown.trigger();
            return Ok(Vec::new());
        };

        let devices = listing?;
        state.events.push(MockEvent::Listed);

        Ok(devices
            .into_iter()
            .map(|device| EnumeratedDevice {
                vendor_id: device.vendor_id,
                product_id: device.product_id,
                bus_number: device.bus_number,
                address: device.address,
                device,
            })
            .collect())
    }

    fn open(&self, device: &MockDevice) -> rusb::Result<MockHandle> {
        let mut state = self.lock();
        state.open_results.pop_front().unwrap_or(Ok(()))?;
        state.events.push(MockEvent::Opened {
            bus_number: device.bus_number,
            address: device.address,
        });

        Ok(MockHandle {
            transport: self.clone(),
            kernel_driver: device.kernel_driver,
        })
    }
}

/// Handle returned by [`MockTransport::open`]
pub struct MockHandle {
    transport: MockTransport,
    kernel_driver: bool,
}

impl TransportHandle for MockHandle {
    fn kernel_driver_active(&self, _interface: u8) -> rusb::Result<bool> {
        Ok(self.kernel_driver)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.kernel_driver = false;
        self.transport
            .lock()
            .events
            .push(MockEvent::DetachedKernelDriver(interface));
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = self.transport.lock();
        state.claim_results.pop_front().unwrap_or(Ok(()))?;
        state.events.push(MockEvent::Claimed(interface));
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.transport
            .lock()
            .events
            .push(MockEvent::Released(interface));
        Ok(())
    }

    fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.transport.lock();
        let Some(result) = state.reads.pop_front() else {
            self.transport.shutdown.trigger();
            return Err(rusb::Error::Interrupted);
        };

        let data = result?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        state.events.push(MockEvent::Read(len));
        Ok(len)
    }
}
