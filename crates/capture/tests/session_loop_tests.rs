//! Integration tests for probe acquisition and the capture loop
//!
//! Drives the loop against the scripted mock transport:
//! - Discovery retries, first-match selection and kernel driver handling
//! - Fatal versus recoverable open/claim failures
//! - Device loss, re-acquisition and decoder reset between sessions
//! - Transfer errors and read timeouts while connected
//! - Running on the dedicated capture thread
//!
//! Run with: `cargo test -p capture --test session_loop_tests`

use capture::usb::mock::{MockDevice, MockEvent, MockTransport};
use capture::usb::{AcquireError, Acquisition, DeviceAcquirer};
use capture::{CaptureConfig, CaptureError, LoopStats, SessionLoop, spawn_capture_thread};
use common::ShutdownSignal;
use protocol::MarkerCheck;
use std::sync::mpsc;
use std::time::Duration;

fn fast_config() -> CaptureConfig {
    let mut config = CaptureConfig::default();
    config.session.retry_interval_ms = 1;
    config
}

fn probe(bus_number: u8, address: u8) -> MockDevice {
    MockDevice::new(0x1d50, 0x6018, bus_number, address)
}

fn run(
    transport: &MockTransport,
    config: &CaptureConfig,
    shutdown: ShutdownSignal,
) -> (Result<LoopStats, CaptureError>, Vec<u8>) {
    let mut session_loop = SessionLoop::new(transport.clone(), config, Vec::new(), shutdown);
    let result = session_loop.run();
    (result, session_loop.into_sink())
}

// ============================================================================
// Acquisition
// ============================================================================

mod acquisition {
    use super::*;

    #[test]
    fn test_not_found_when_no_match() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport.push_listing(vec![MockDevice::new(0x046d, 0xc52b, 1, 3)]);

        let acquirer = DeviceAcquirer::new(transport.clone(), &fast_config());
        let outcome = acquirer.acquire().unwrap();

        assert!(matches!(outcome, Acquisition::NotFound));
        assert!(transport.opened().is_empty());
    }

    #[test]
    fn test_first_match_wins() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport.push_listing(vec![
            MockDevice::new(0x046d, 0xc52b, 1, 1),
            probe(1, 7),
            probe(2, 3),
        ]);

        let acquirer = DeviceAcquirer::new(transport.clone(), &fast_config());
        let outcome = acquirer.acquire().unwrap();

        match outcome {
            Acquisition::Connected(session) => {
                assert_eq!(session.bus_number(), 1);
                assert_eq!(session.address(), 7);
            }
            Acquisition::NotFound => panic!("expected a session"),
        }
        assert_eq!(transport.opened(), vec![(1, 7)]);
    }

    #[test]
    fn test_custom_identity() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport.push_listing(vec![probe(1, 1), MockDevice::new(0x1d50, 0x6017, 1, 2)]);

        let mut config = fast_config();
        config.device.product_id = 0x6017;

        let acquirer = DeviceAcquirer::new(transport.clone(), &config);
        assert!(matches!(
            acquirer.acquire().unwrap(),
            Acquisition::Connected(_)
        ));
        assert_eq!(transport.opened(), vec![(1, 2)]);
    }

    #[test]
    fn test_claims_configured_interface() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport.push_listing(vec![probe(1, 4)]);

        let acquirer = DeviceAcquirer::new(transport.clone(), &fast_config());
        let session = acquirer.acquire().unwrap();

        assert!(transport.events().contains(&MockEvent::Claimed(5)));
        drop(session);
        assert_eq!(transport.events().last(), Some(&MockEvent::Released(5)));
    }

    #[test]
    fn test_kernel_driver_detached_before_claim() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport.push_listing(vec![probe(1, 4).with_kernel_driver()]);

        let acquirer = DeviceAcquirer::new(transport.clone(), &fast_config());
        let _session = acquirer.acquire().unwrap();

        let events = transport.events();
        let detached = events
            .iter()
            .position(|e| *e == MockEvent::DetachedKernelDriver(5))
            .expect("kernel driver should be detached");
        let claimed = events
            .iter()
            .position(|e| *e == MockEvent::Claimed(5))
            .expect("interface should be claimed");
        assert!(detached < claimed);
    }

    #[test]
    fn test_kernel_driver_left_alone_when_disabled() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport.push_listing(vec![probe(1, 4).with_kernel_driver()]);

        let mut config = fast_config();
        config.device.detach_kernel_driver = false;

        let acquirer = DeviceAcquirer::new(transport.clone(), &config);
        let _session = acquirer.acquire().unwrap();

        assert!(
            !transport
                .events()
                .iter()
                .any(|e| matches!(e, MockEvent::DetachedKernelDriver(_)))
        );
    }

    #[test]
    fn test_list_returns_every_device() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport.push_listing(vec![MockDevice::new(0x046d, 0xc52b, 1, 1), probe(1, 7)]);

        let acquirer = DeviceAcquirer::new(transport, &fast_config());
        let devices = acquirer.list().unwrap();

        assert_eq!(devices.len(), 2);
        assert!(!devices[0].matches(acquirer.identity()));
        assert!(devices[1].matches(acquirer.identity()));
    }
}

// ============================================================================
// Open and claim failures
// ============================================================================

mod failures {
    use super::*;

    #[test]
    fn test_open_no_device_is_not_found() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_open_result(Err(rusb::Error::NoDevice));

        let acquirer = DeviceAcquirer::new(transport, &fast_config());
        assert!(matches!(acquirer.acquire().unwrap(), Acquisition::NotFound));
    }

    #[test]
    fn test_open_access_denied_is_fatal() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_open_result(Err(rusb::Error::Access));

        let acquirer = DeviceAcquirer::new(transport, &fast_config());
        let err = acquirer.acquire().unwrap_err();

        assert!(matches!(
            err,
            AcquireError::Open {
                bus_number: 1,
                address: 2,
                source: rusb::Error::Access,
                ..
            }
        ));
    }

    #[test]
    fn test_claim_busy_is_fatal() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_claim_result(Err(rusb::Error::Busy));

        let acquirer = DeviceAcquirer::new(transport, &fast_config());
        let err = acquirer.acquire().unwrap_err();

        assert!(matches!(
            err,
            AcquireError::Claim {
                interface: 5,
                source: rusb::Error::Busy,
                ..
            }
        ));
    }

    #[test]
    fn test_claim_no_device_is_not_found() {
        let transport = MockTransport::new(ShutdownSignal::new());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_claim_result(Err(rusb::Error::NoDevice));

        let acquirer = DeviceAcquirer::new(transport, &fast_config());
        assert!(matches!(acquirer.acquire().unwrap(), Acquisition::NotFound));
    }

    #[test]
    fn test_relaxed_policy_keeps_searching() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_open_result(Err(rusb::Error::Access))
            .push_listing(vec![probe(1, 2)])
            .push_read(&[0x02, 0x08, b'k']);

        let mut config = fast_config();
        config.session.exit_on_open_error = false;

        let (result, output) = run(&transport, &config, shutdown);
        let stats = result.unwrap();

        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(output, b"k");
    }

    #[test]
    fn test_fatal_open_error_ends_loop() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_open_result(Err(rusb::Error::Access));

        let (result, output) = run(&transport, &fast_config(), shutdown.clone());

        assert!(matches!(
            result,
            Err(CaptureError::Acquire(AcquireError::Open { .. }))
        ));
        assert!(output.is_empty());
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn test_enumeration_error_ends_loop() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport.push_listing_error(rusb::Error::NoMem);

        let (result, _) = run(&transport, &fast_config(), shutdown);

        assert!(matches!(
            result,
            Err(CaptureError::Acquire(AcquireError::Enumeration(
                rusb::Error::NoMem
            )))
        ));
    }
}

// ============================================================================
// Capture loop
// ============================================================================

mod capture_loop {
    use super::*;

    #[test]
    fn test_waits_for_probe_then_streams() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![])
            .push_listing(vec![probe(1, 2)])
            .push_read(&[0x02, 0x08, 0x41, 0x02, 0x08, 0x42]);

        let (result, output) = run(&transport, &fast_config(), shutdown);
        let stats = result.unwrap();

        assert_eq!(output, b"AB");
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.bytes_written, 2);
        assert_eq!(transport.list_calls(), 2);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_read(&[0x02])
            .push_read(&[0x08, b'h', 0x02, 0x08])
            .push_read(&[])
            .push_read(&[b'i']);

        let (result, output) = run(&transport, &fast_config(), shutdown);

        assert!(result.is_ok());
        assert_eq!(output, b"hi");
    }

    #[test]
    fn test_device_loss_reacquires_with_clean_decoder() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_read(&[0x02, 0x08, b'a', 0x02, 0x08])
            .push_read_error(rusb::Error::NoDevice)
            .push_listing(vec![probe(1, 9)])
            .push_read(&[0x02, 0x08, b'b']);

        let (result, output) = run(&transport, &fast_config(), shutdown);
        let stats = result.unwrap();

        // The half frame from the first session must not leak into the second
        assert_eq!(output, b"ab");
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.devices_lost, 1);
        assert_eq!(transport.opened(), vec![(1, 2), (1, 9)]);

        let events = transport.events();
        let released = events
            .iter()
            .position(|e| *e == MockEvent::Released(5))
            .expect("first session should release its interface");
        let reopened = events
            .iter()
            .position(|e| {
                *e == MockEvent::Opened {
                    bus_number: 1,
                    address: 9,
                }
            })
            .expect("probe should be reopened");
        assert!(released < reopened);
    }

    #[test]
    fn test_invalid_frames_skipped() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_read(&[0x02, 0x00, b'x', 0x02, 0x08, b'y']);

        let mut config = fast_config();
        config.decoder.marker_check = MarkerCheck::Both;

        let (result, output) = run(&transport, &config, shutdown);
        let stats = result.unwrap();

        assert_eq!(output, b"y");
        assert_eq!(stats.invalid_frames, 1);
    }

    #[test]
    fn test_single_marker_byte_accepted_by_default() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_read(&[0x02, 0x00, b'x', 0x02, 0x08, b'y']);

        let (result, output) = run(&transport, &fast_config(), shutdown);

        assert_eq!(result.unwrap().invalid_frames, 0);
        assert_eq!(output, b"xy");
    }

    #[test]
    fn test_read_timeouts_are_idle_polls() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_read_error(rusb::Error::Timeout)
            .push_read_error(rusb::Error::Timeout)
            .push_read(&[0x02, 0x08, b'z']);

        let mut config = fast_config();
        config.session.read_timeout_ms = 10;

        let (result, output) = run(&transport, &config, shutdown);
        let stats = result.unwrap();

        assert_eq!(output, b"z");
        // Only the read that ends the script counts as a failure
        assert_eq!(stats.transfer_errors, 1);
        assert_eq!(stats.devices_lost, 0);
    }

    #[test]
    fn test_shutdown_stops_search() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport.push_listing(vec![]).push_listing(vec![]);

        let (result, output) = run(&transport, &fast_config(), shutdown.clone());
        let stats = result.unwrap();

        assert!(shutdown.is_triggered());
        assert!(output.is_empty());
        assert_eq!(stats.sessions, 0);
        // Two scripted listings plus the one that ran dry
        assert_eq!(stats.not_found, 3);
    }
}

// ============================================================================
// Capture thread
// ============================================================================

mod capture_thread {
    use super::*;

    #[test]
    fn test_thread_reports_stats() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_read(&[0x02, 0x08, b'o', 0x02, 0x08, b'k']);

        let (tx, rx) = mpsc::channel();
        let handle = spawn_capture_thread(
            transport,
            fast_config(),
            Vec::new(),
            shutdown,
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();

        let stats = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        handle.join().unwrap();

        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.bytes_written, 2);
    }

    #[test]
    fn test_thread_reports_fatal_error() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(shutdown.clone());
        transport
            .push_listing(vec![probe(1, 2)])
            .push_claim_result(Err(rusb::Error::Busy));

        let (tx, rx) = mpsc::channel();
        let handle = spawn_capture_thread(
            transport,
            fast_config(),
            Vec::new(),
            shutdown,
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert!(matches!(
            result,
            Err(CaptureError::Acquire(AcquireError::Claim { .. }))
        ));
    }

    #[test]
    fn test_external_shutdown() {
        let shutdown = ShutdownSignal::new();
        let transport = MockTransport::new(ShutdownSignal::new());
        // Keep the loop searching until told to stop
        for _ in 0..10_000 {
            transport.push_listing(vec![]);
        }

        let (tx, rx) = mpsc::channel();
        let handle = spawn_capture_thread(
            transport,
            fast_config(),
            Vec::new(),
            shutdown.clone(),
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        shutdown.trigger();

        let stats = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        handle.join().unwrap();

        assert_eq!(stats.sessions, 0);
        assert!(stats.not_found > 0);
    }
}
