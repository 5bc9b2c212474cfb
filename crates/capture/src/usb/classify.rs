//! Transport error classification
//!
//! Every libusb failure in the capture path is routed through
//! [`ErrorPolicy::classify`] so the fatal / re-acquire / retry decision is
//! made in exactly one place.

/// Which transport operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Enumerate,
    Open,
    Claim,
    Read,
}

/// What the caller should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Give up; the process exits with status 1
    Fatal,
    /// Drop the session and go back to searching
    Reacquire,
    /// Retry the same operation
    Retry,
}

/// Tunable parts of the classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    /// Treat open/claim failures other than a vanished device as fatal.
    /// When false they are retried through re-acquisition instead.
    pub exit_on_open_error: bool,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            exit_on_open_error: true,
        }
    }
}

impl ErrorPolicy {
    pub fn classify(&self, stage: Stage, error: &rusb::Error) -> ErrorClass {
        let gone = matches!(error, rusb::Error::NoDevice);

        match stage {
            Stage::Enumerate => ErrorClass::Fatal,
            Stage::Open | Stage::Claim if gone => ErrorClass::Reacquire,
            Stage::Open | Stage::Claim if self.exit_on_open_error => ErrorClass::Fatal,
            Stage::Open | Stage::Claim => ErrorClass::Reacquire,
            Stage::Read if gone => ErrorClass::Reacquire,
            Stage::Read => ErrorClass::Retry,
        }
    }
}
