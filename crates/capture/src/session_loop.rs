//! Capture state machine
//!
//! ```text
//!            NotFound (wait)
//!              ┌──────┐
//!              ▼      │
//!   ──► Searching ────┘
//!          │  ▲
//!  session │  │ wait
//!          ▼  │
//!     Connected ──► Lost
//!            device gone
//! ```
//!
//! Runs until a fatal error or until the shutdown signal is triggered.
//! The loop owns the only [`DeviceSession`] and the [`FrameDecoder`], so no
//! locking is needed; it is meant to run on its own OS thread.

use crate::config::CaptureConfig;
use crate::usb::{
    AcquireError, Acquisition, DeviceAcquirer, DeviceSession, ReadError, UsbTransport,
};
use common::ShutdownSignal;
use protocol::FrameDecoder;
use std::io::{self, Write};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that end the capture loop
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("Failed to write trace output: {0}")]
    Output(#[from] io::Error),
}

/// Counters over the whole lifetime of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Successful acquisitions
    pub sessions: u64,
    /// Acquisition passes that found nothing
    pub not_found: u64,
    /// Sessions ended by the device going away
    pub devices_lost: u64,
    /// Failed reads that were retried
    pub transfer_errors: u64,
    /// Decoded bytes written to the sink
    pub bytes_written: u64,
    /// Frames dropped for a bad marker
    pub invalid_frames: u64,
}

enum State<S> {
    Searching,
    Connected(S),
    Lost,
}

/// Drives acquirer → session → decoder → sink forever
pub struct SessionLoop<T: UsbTransport, W: Write> {
    acquirer: DeviceAcquirer<T>,
    decoder: FrameDecoder,
    sink: W,
    shutdown: ShutdownSignal,
    retry_interval: Duration,
    max_consecutive_transfer_errors: u32,
    stats: LoopStats,
}

impl<T: UsbTransport, W: Write> SessionLoop<T, W> {
    pub fn new(transport: T, config: &CaptureConfig, sink: W, shutdown: ShutdownSignal) -> Self {
        Self {
            acquirer: DeviceAcquirer::new(transport, config),
            decoder: FrameDecoder::new(config.decoder.marker, config.decoder.marker_check),
            sink,
            shutdown,
            retry_interval: config.retry_interval(),
            max_consecutive_transfer_errors: config.session.max_consecutive_transfer_errors,
            stats: LoopStats::default(),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Give back the output sink
    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Run until shutdown (`Ok`) or a fatal error (`Err`)
    pub fn run(&mut self) -> Result<LoopStats, CaptureError> {
        let mut state = State::Searching;

        while !self.shutdown.is_triggered() {
            state = self.step(state)?;
        }

        info!("Capture loop stopped");
        Ok(self.stats)
    }

    fn step(
        &mut self,
        state: State<DeviceSession<T::Handle>>,
    ) -> Result<State<DeviceSession<T::Handle>>, CaptureError> {
        match state {
            State::Searching => match self.acquirer.acquire()? {
                Acquisition::Connected(session) => {
                    info!(
                        "Connected to probe (bus {}, device {})",
                        session.bus_number(),
                        session.address()
                    );
                    self.decoder.reset();
                    self.stats.sessions += 1;
                    Ok(State::Connected(session))
                }
                Acquisition::NotFound => {
                    self.stats.not_found += 1;
                    self.shutdown.sleep(self.retry_interval);
                    Ok(State::Searching)
                }
            },
            State::Connected(mut session) => {
                let lost = self.stream(&mut session)?;
                self.end_session(session);
                if lost {
                    self.stats.devices_lost += 1;
                    Ok(State::Lost)
                } else {
                    Ok(State::Searching)
                }
            }
            State::Lost => {
                self.shutdown.sleep(self.retry_interval);
                Ok(State::Searching)
            }
        }
    }

    /// Pump chunks from the session into the sink
    ///
    /// Returns `true` when the device went away, `false` on shutdown.
    fn stream(&mut self, session: &mut DeviceSession<T::Handle>) -> Result<bool, CaptureError> {
        let mut consecutive_errors = 0u32;

        while !self.shutdown.is_triggered() {
            match session.read_chunk(&self.shutdown) {
                Ok(chunk) => {
                    consecutive_errors = 0;
                    for item in self.decoder.feed(chunk) {
                        match item {
                            Ok(byte) => {
                                self.sink.write_all(&[byte])?;
                                self.sink.flush()?;
                                self.stats.bytes_written += 1;
                            }
                            Err(invalid) if invalid.first_in_run => warn!("{}", invalid),
                            Err(invalid) => debug!("{}", invalid),
                        }
                    }
                }
                Err(ReadError::DeviceLost) => {
                    warn!("Black Magic probe disconnected");
                    return Ok(true);
                }
                Err(ReadError::Cancelled) => break,
                Err(ReadError::Transfer(e)) => {
                    self.stats.transfer_errors += 1;
                    consecutive_errors += 1;
                    error!("Bulk transfer failed: {}", e);

                    if consecutive_errors >= self.max_consecutive_transfer_errors {
                        warn!(
                            "{} consecutive transfer errors, pausing before retrying",
                            consecutive_errors
                        );
                        consecutive_errors = 0;
                        self.shutdown.sleep(self.retry_interval);
                    }
                }
            }
        }

        Ok(false)
    }

    fn end_session(&mut self, session: DeviceSession<T::Handle>) {
        let stats = self.decoder.take_stats();
        self.stats.invalid_frames += stats.invalid_frames;
        info!(
            "Session ended: {} frames decoded, {} invalid, {} bytes received",
            stats.frames_decoded, stats.invalid_frames, stats.bytes_consumed
        );
        drop(session);
        self.decoder.reset();
    }
}

/// Run the capture loop on a dedicated thread
///
/// The loop result is passed to `on_exit` when the thread finishes.
pub fn spawn_capture_thread<T, W, F>(
    transport: T,
    config: CaptureConfig,
    sink: W,
    shutdown: ShutdownSignal,
    on_exit: F,
) -> io::Result<JoinHandle<()>>
where
    T: UsbTransport + Send + 'static,
    W: Write + Send + 'static,
    F: FnOnce(Result<LoopStats, CaptureError>) + Send + 'static,
{
    std::thread::Builder::new()
        .name("usb-capture".to_string())
        .spawn(move || {
            info!("Capture thread started");
            let mut session_loop = SessionLoop::new(transport, &config, sink, shutdown);
            let result = session_loop.run();
            if let Err(e) = &result {
                error!("Capture loop failed: {}", e);
            }
            on_exit(result);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::{MockDevice, MockTransport};
    use std::time::Instant;

    fn fast_config() -> CaptureConfig {
        let mut config = CaptureConfig::default();
        config.session.retry_interval_ms = 1;
        config
    }

    fn probe() -> MockDevice {
        MockDevice::new(0x1d50, 0x6018, 1, 2)
    }

    #[test]
    fn test_shutdown_before_start_does_nothing() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let transport = MockTransport::new(shutdown.clone());

        let mut session_loop =
            SessionLoop::new(transport.clone(), &fast_config(), Vec::new(), shutdown);
        let stats = session_loop.run().unwrap();

        assert_eq!(stats, LoopStats::default());
        assert_eq!(transport.list_calls(), 0);
    }

    #[test]
    fn test_stats_count_bytes_and_invalid_frames() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe()])
            .push_read(&[0x02, 0x08, b'h', 0xff, 0xff, 0x00, 0x02, 0x08, b'i']);

        let mut session_loop =
            SessionLoop::new(transport.clone(), &fast_config(), Vec::new(), shutdown);
        let stats = session_loop.run().unwrap();

        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.bytes_written, 2);
        assert_eq!(stats.invalid_frames, 1);
        assert_eq!(session_loop.into_sink(), b"hi");
    }

    #[test]
    fn test_transfer_errors_stay_connected() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe()])
            .push_read_error(rusb::Error::Io)
            .push_read_error(rusb::Error::Pipe)
            .push_read(&[0x02, 0x08, b'!']);

        let mut config = fast_config();
        config.session.max_consecutive_transfer_errors = 1;
        config.session.retry_interval_ms = 40;

        let started = Instant::now();
        let mut session_loop = SessionLoop::new(transport.clone(), &config, Vec::new(), shutdown);
        let stats = session_loop.run().unwrap();
        let elapsed = started.elapsed();

        // Two scripted errors plus the Interrupted read that ends the script
        assert_eq!(stats.transfer_errors, 3);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.devices_lost, 0);
        assert_eq!(transport.list_calls(), 1);
        assert_eq!(session_loop.into_sink(), b"!");
        // Each scripted error hits the cap and pauses one retry interval
        assert!(elapsed >= Duration::from_millis(80), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_transfer_errors_below_cap_retry_immediately() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe()])
            .push_read_error(rusb::Error::Io)
            .push_read_error(rusb::Error::Pipe)
            .push_read(&[0x02, 0x08, b'!']);

        let mut config = fast_config();
        config.session.max_consecutive_transfer_errors = 16;
        config.session.retry_interval_ms = 5_000;

        let started = Instant::now();
        let mut session_loop = SessionLoop::new(transport, &config, Vec::new(), shutdown);
        let stats = session_loop.run().unwrap();

        assert_eq!(stats.transfer_errors, 3);
        assert!(started.elapsed() < Duration::from_millis(5_000));
    }
}
