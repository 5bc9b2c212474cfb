//! Trace stream framing for bmp-traceswo
//!
//! The Black Magic Probe trace-capture endpoint delivers debug output as a
//! continuous byte stream of 3-byte frames: a 2-byte marker followed by one
//! payload byte. USB reads chop that stream at arbitrary points, so frames
//! regularly straddle two reads. This crate reassembles them.
//!
//! # Example
//!
//! ```
//! use protocol::FrameDecoder;
//!
//! let mut decoder = FrameDecoder::default();
//!
//! // A frame split across two reads
//! let first: Vec<u8> = decoder.feed(&[0x02, 0x08]).filter_map(Result::ok).collect();
//! assert!(first.is_empty());
//!
//! let second: Vec<u8> = decoder.feed(&[b'A', 0x02, 0x08, b'B']).filter_map(Result::ok).collect();
//! assert_eq!(second, b"AB");
//! ```

pub mod decoder;
pub mod error;
pub mod frame;

pub use decoder::{Decoded, DecoderState, DecoderStats, FrameDecoder};
pub use error::InvalidFrame;
pub use frame::{DEFAULT_MARKER, FRAME_LEN, Marker, MarkerCheck};
