//! Device identity and enumeration results

use std::fmt;

/// Vendor/product pair identifying the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl TargetIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// One entry of a device listing
///
/// Only lives for a single enumeration pass. `device` is whatever the
/// transport needs to open it later.
#[derive(Debug, Clone)]
pub struct EnumeratedDevice<D> {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub device: D,
}

impl<D> EnumeratedDevice<D> {
    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity::new(self.vendor_id, self.product_id)
    }

    pub fn matches(&self, target: TargetIdentity) -> bool {
        self.identity() == target
    }
}

impl<D> fmt::Display for EnumeratedDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (bus {}, device {})",
            self.identity(),
            self.bus_number,
            self.address
        )
    }
}
