//! bmp-traceswo capture library
//!
//! Attaches to a Black Magic Probe, reads its trace-capture endpoint and
//! decodes the framed debug output. Survives the probe being unplugged,
//! replugged or absent at startup.
//!
//! The binary in `main.rs` is a thin shell around [`session_loop`].

pub mod config;
pub mod session_loop;
pub mod usb;

pub use config::CaptureConfig;
pub use session_loop::{CaptureError, LoopStats, SessionLoop, spawn_capture_thread};
