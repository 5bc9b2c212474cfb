//! Common utilities for bmp-traceswo
//!
//! Shared error type, logging setup and the cooperative shutdown flag used
//! between the signal handler and the capture thread.

pub mod error;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use shutdown::ShutdownSignal;
