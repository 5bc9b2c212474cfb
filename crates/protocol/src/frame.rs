//! Frame layout and marker validation

use serde::{Deserialize, Serialize};

/// Total size of one frame: 2 marker bytes + 1 payload byte
pub const FRAME_LEN: usize = 3;

/// Marker emitted by the probe in front of every trace byte
pub const DEFAULT_MARKER: Marker = Marker([0x02, 0x08]);

/// The fixed 2-byte frame prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Marker(pub [u8; 2]);

impl Default for Marker {
    fn default() -> Self {
        DEFAULT_MARKER
    }
}

/// How strictly a frame header is compared against the marker
///
/// `Either` accepts a header when one marker byte matches, so a frame
/// survives a single corrupted marker byte. `Both` rejects anything but an
/// exact marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerCheck {
    /// Accept when the first or the second byte matches
    #[default]
    Either,
    /// Accept only when both bytes match
    Both,
}

impl Marker {
    /// Check a received header against this marker
    pub fn accepts(&self, header: [u8; 2], check: MarkerCheck) -> bool {
        let first = header[0] == self.0[0];
        let second = header[1] == self.0[1];

        match check {
            MarkerCheck::Either => first || second,
            MarkerCheck::Both => first && second,
        }
    }
}
