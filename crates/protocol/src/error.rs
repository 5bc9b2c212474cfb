//! Decoder error types

use thiserror::Error;

/// A 3-byte window whose marker did not pass validation
///
/// The whole window has already been discarded by the time this is
/// reported; decoding continues with the byte after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid frame: {:02x} {:02x} (payload {:02x})", header[0], header[1], payload)]
pub struct InvalidFrame {
    /// The two bytes found where the marker was expected
    pub header: [u8; 2],
    /// The byte that would have been the payload
    pub payload: u8,
    /// True when this is the first invalid frame after valid data
    pub first_in_run: bool,
}
