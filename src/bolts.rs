//! Named after LibAFL Bolts
//!
//! Stuff and functions that are handy but not directly related to the fuzzing core

use std::io::ErrorKind;

use libafl_bolts::{current_time, Error, ErrorBacktrace};

pub fn timeout_error(msg: impl Into<String>) -> Error {
    Error::File(
        std::io::Error::new(ErrorKind::TimedOut, msg.into()),
        ErrorBacktrace::new(),
    )
}

/// Wall clock, in milliseconds since the epoch.
pub fn current_millis() -> u64 {
    current_time().as_millis() as u64
}

/// Wall clock, in microseconds since the epoch.
pub fn current_micros() -> u64 {
    current_time().as_micros() as u64
}
