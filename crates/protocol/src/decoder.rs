//! Streaming frame decoder
//!
//! Treats every chunk handed to [`FrameDecoder::feed`] as the continuation of
//! one unbounded byte stream. Up to two bytes of an incomplete frame are
//! carried in [`DecoderState`] until the next chunk arrives.

use crate::error::InvalidFrame;
use crate::frame::{FRAME_LEN, Marker, MarkerCheck};
use std::iter::FusedIterator;

/// Bytes carried between chunks
///
/// Never holds a complete frame: the pending length is always below
/// [`FRAME_LEN`].
#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    pending: [u8; FRAME_LEN - 1],
    pending_len: usize,
    /// Set after an invalid frame, cleared by the next valid one
    resyncing: bool,
}

impl DecoderState {
    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> &[u8] {
        &self.pending[..self.pending_len]
    }

    /// True when no partial frame is buffered
    pub fn is_empty(&self) -> bool {
        self.pending_len == 0
    }

    /// True while the stream is between an invalid frame and the next valid one
    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    /// Forget any partial frame
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn stash(&mut self, tail: &[u8]) {
        let end = self.pending_len + tail.len();
        debug_assert!(end < FRAME_LEN);
        self.pending[self.pending_len..end].copy_from_slice(tail);
        self.pending_len = end;
    }
}

// Bytes past `pending_len` are stale and take no part in equality
impl PartialEq for DecoderState {
    fn eq(&self, other: &Self) -> bool {
        self.pending() == other.pending() && self.resyncing == other.resyncing
    }
}

impl Eq for DecoderState {}

/// Running decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Bytes taken from fed chunks (including pending ones)
    pub bytes_consumed: u64,
    /// Frames that passed marker validation
    pub frames_decoded: u64,
    /// Frames dropped for a bad marker
    pub invalid_frames: u64,
}

/// Reassembles 3-byte trace frames from arbitrarily chunked reads
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    marker: Marker,
    check: MarkerCheck,
    state: DecoderState,
    stats: DecoderStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Marker::default(), MarkerCheck::default())
    }
}

impl FrameDecoder {
    /// Create a decoder with an empty state
    pub fn new(marker: Marker, check: MarkerCheck) -> Self {
        Self {
            marker,
            check,
            state: DecoderState::default(),
            stats: DecoderStats::default(),
        }
    }

    /// Current carried-over state
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Counters accumulated since creation or the last [`take_stats`](Self::take_stats)
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Return the counters and start new ones
    pub fn take_stats(&mut self) -> DecoderStats {
        std::mem::take(&mut self.stats)
    }

    /// Drop any partial frame so the next chunk starts on a frame boundary
    ///
    /// Must be called whenever the byte stream is interrupted, e.g. after the
    /// device has been re-acquired.
    pub fn reset(&mut self) {
        self.state.clear();
    }

    /// Feed one chunk and lazily decode it
    ///
    /// Each item is either a payload byte or an [`InvalidFrame`] report. Bytes
    /// that do not complete a frame are kept for the next call. Dropping the
    /// returned iterator early still consumes the whole chunk (the remaining
    /// payload bytes are discarded) so frame alignment is never lost.
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> Decoded<'a> {
        Decoded {
            decoder: self,
            chunk,
            pos: 0,
        }
    }

    fn classify(&mut self, window: [u8; FRAME_LEN]) -> Result<u8, InvalidFrame> {
        let header = [window[0], window[1]];

        if self.marker.accepts(header, self.check) {
            self.state.resyncing = false;
            self.stats.frames_decoded += 1;
            Ok(window[2])
        } else {
            let first_in_run = !self.state.resyncing;
            self.state.resyncing = true;
            self.stats.invalid_frames += 1;
            Err(InvalidFrame {
                header,
                payload: window[2],
                first_in_run,
            })
        }
    }
}

/// Lazy decode of one chunk, see [`FrameDecoder::feed`]
pub struct Decoded<'a> {
    decoder: &'a mut FrameDecoder,
    chunk: &'a [u8],
    pos: usize,
}

impl Iterator for Decoded<'_> {
    type Item = Result<u8, InvalidFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunk;
        let remaining = &chunk[self.pos..];
        let pending_len = self.decoder.state.pending_len;

        if pending_len + remaining.len() < FRAME_LEN {
            self.decoder.state.stash(remaining);
            self.decoder.stats.bytes_consumed += remaining.len() as u64;
            self.pos = chunk.len();
            return None;
        }

        let take = FRAME_LEN - pending_len;
        let mut window = [0u8; FRAME_LEN];
        window[..pending_len].copy_from_slice(self.decoder.state.pending());
        window[pending_len..].copy_from_slice(&remaining[..take]);

        self.pos += take;
        self.decoder.state.pending_len = 0;
        self.decoder.stats.bytes_consumed += take as u64;

        Some(self.decoder.classify(window))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let available = self.decoder.state.pending_len + self.chunk.len() - self.pos;
        (0, Some(available / FRAME_LEN))
    }
}

impl FusedIterator for Decoded<'_> {}

impl Drop for Decoded<'_> {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}
