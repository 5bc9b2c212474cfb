//! USB subsystem
//!
//! Finds the probe, opens it and reads the trace endpoint.
//!
//! - [`transport`]: the seam to libusb (`rusb`), mockable in tests
//! - [`classify`]: maps transport errors onto fatal / re-acquire / retry
//! - [`acquirer`]: enumerate, match, open, claim
//! - [`session`]: one live, claimed connection
//!
//! Everything here is blocking and runs on the capture thread.

pub mod acquirer;
pub mod classify;
pub mod device;
pub mod mock;
pub mod session;
pub mod transport;

pub use acquirer::{AcquireError, Acquisition, DeviceAcquirer};
pub use classify::{ErrorClass, ErrorPolicy, Stage};
pub use device::{EnumeratedDevice, TargetIdentity};
pub use session::{DeviceSession, ReadError};
pub use transport::{RusbTransport, TransportHandle, UsbTransport};
