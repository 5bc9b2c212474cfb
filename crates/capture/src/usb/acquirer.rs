//! Probe discovery
//!
//! One [`DeviceAcquirer::acquire`] call is one pass of: list devices, pick the
//! first one matching the target identity, open it, claim the trace
//! interface. A device that disappears halfway through is reported as
//! [`Acquisition::NotFound`]; anything else that goes wrong is an
//! [`AcquireError`].

use crate::config::CaptureConfig;
use crate::usb::classify::{ErrorClass, ErrorPolicy, Stage};
use crate::usb::device::{EnumeratedDevice, TargetIdentity};
use crate::usb::session::DeviceSession;
use crate::usb::transport::{TransportHandle, UsbTransport};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fatal acquisition failures
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Failed to list USB devices: {0}")]
    Enumeration(#[source] rusb::Error),

    #[error("Failed to open {identity} (bus {bus_number}, device {address}): {source}")]
    Open {
        identity: TargetIdentity,
        bus_number: u8,
        address: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Failed to claim interface {interface} of {identity}: {source}")]
    Claim {
        identity: TargetIdentity,
        interface: u8,
        #[source]
        source: rusb::Error,
    },
}

/// Outcome of one acquisition pass
pub enum Acquisition<H: TransportHandle> {
    Connected(DeviceSession<H>),
    NotFound,
}

impl<H: TransportHandle> std::fmt::Debug for Acquisition<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(session) => write!(
                f,
                "Connected(bus {}, device {})",
                session.bus_number(),
                session.address()
            ),
            Self::NotFound => write!(f, "NotFound"),
        }
    }
}

/// Finds, opens and claims the probe
pub struct DeviceAcquirer<T: UsbTransport> {
    transport: T,
    config: CaptureConfig,
    identity: TargetIdentity,
    policy: ErrorPolicy,
}

impl<T: UsbTransport> DeviceAcquirer<T> {
    pub fn new(transport: T, config: &CaptureConfig) -> Self {
        Self {
            transport,
            identity: config.identity(),
            policy: config.error_policy(),
            config: config.clone(),
        }
    }

    pub fn identity(&self) -> TargetIdentity {
        self.identity
    }

    /// List every attached device
    pub fn list(&self) -> Result<Vec<EnumeratedDevice<T::Device>>, AcquireError> {
        self.transport
            .list_devices()
            .map_err(AcquireError::Enumeration)
    }

    /// Run one acquisition pass
    pub fn acquire(&self) -> Result<Acquisition<T::Handle>, AcquireError> {
        info!("Trying to find Black Magic probe ({})", self.identity);

        let devices = self.list()?;
        for device in &devices {
            debug!("{}", device);
        }

        let Some(found) = devices.iter().find(|d| d.matches(self.identity)) else {
            warn!("Black Magic probe not found");
            return Ok(Acquisition::NotFound);
        };

        let (bus_number, address) = (found.bus_number, found.address);
        info!("Found probe: {}", found);

        let opened = self.transport.open(&found.device);
        // Release the listing before touching the device any further
        drop(devices);

        let mut handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to open probe: {}", e);
                return match self.policy.classify(Stage::Open, &e) {
                    ErrorClass::Fatal => Err(AcquireError::Open {
                        identity: self.identity,
                        bus_number,
                        address,
                        source: e,
                    }),
                    ErrorClass::Reacquire | ErrorClass::Retry => Ok(Acquisition::NotFound),
                };
            }
        };

        let interface = self.config.device.interface;

        if self.config.device.detach_kernel_driver {
            detach_kernel_driver(&mut handle, interface);
        }

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            return match self.policy.classify(Stage::Claim, &e) {
                ErrorClass::Fatal => Err(AcquireError::Claim {
                    identity: self.identity,
                    interface,
                    source: e,
                }),
                ErrorClass::Reacquire | ErrorClass::Retry => Ok(Acquisition::NotFound),
            };
        }

        debug!("Claimed interface {}", interface);
        Ok(Acquisition::Connected(DeviceSession::new(
            handle,
            &self.config,
            bus_number,
            address,
        )))
    }
}

/// Detach a kernel driver bound to `interface`, if any
///
/// Failures are only logged; the subsequent claim reports the real problem.
fn detach_kernel_driver<H: TransportHandle>(handle: &mut H, interface: u8) {
    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            if let Err(e) = handle.detach_kernel_driver(interface) {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
            }
        }
        Ok(false) => {
            debug!("No kernel driver active on interface {}", interface);
        }
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
        }
    }
}
