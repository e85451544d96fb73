//! Signal semantics, reduced to atomic flags.
//!
//! Handlers do no work of their own; every blocking boundary in the campaign
//! polls these flags and unwinds cleanly. Suspend and pipe signals are
//! ignored outright.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use libafl_bolts::Error;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGWINCH};

/// The asynchronous inputs the campaign reacts to.
#[derive(Debug, Clone)]
pub struct SessionFlags {
    /// Terminating signal received; wind the run down.
    pub stop: Arc<AtomicBool>,
    /// `SIGUSR1`: abandon the entry currently being worked on.
    pub skip: Arc<AtomicBool>,
    /// `SIGWINCH`: the next status display should redraw in full.
    pub refresh: Arc<AtomicBool>,
}

impl SessionFlags {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Check-and-clear the skip request.
    pub fn take_skip(&self) -> bool {
        self.skip.swap(false, Ordering::Relaxed)
    }

    /// Check-and-clear the redraw request.
    pub fn take_refresh(&self) -> bool {
        self.refresh.swap(false, Ordering::Relaxed)
    }
}

/// Install all handlers and hand out the flags they feed.
pub fn install() -> Result<SessionFlags, Error> {
    let flags = SessionFlags {
        stop: Arc::new(AtomicBool::new(false)),
        skip: Arc::new(AtomicBool::new(false)),
        refresh: Arc::new(AtomicBool::new(false)),
    };

    for sig in [SIGINT, SIGHUP, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&flags.stop))
            .map_err(|e| Error::unknown(format!("Could not install stop handler: {e}")))?;
    }
    signal_hook::flag::register(SIGUSR1, Arc::clone(&flags.skip))
        .map_err(|e| Error::unknown(format!("Could not install skip handler: {e}")))?;
    signal_hook::flag::register(SIGWINCH, Arc::clone(&flags.refresh))
        .map_err(|e| Error::unknown(format!("Could not install refresh handler: {e}")))?;

    // Things we do not want to hear about at all.
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGTSTP, &ignore)
            .map_err(|e| Error::unknown(format!("Could not ignore SIGTSTP: {e}")))?;
        sigaction(Signal::SIGPIPE, &ignore)
            .map_err(|e| Error::unknown(format!("Could not ignore SIGPIPE: {e}")))?;
    }

    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_is_check_and_clear() {
        let flags = SessionFlags {
            stop: Arc::new(AtomicBool::new(false)),
            skip: Arc::new(AtomicBool::new(true)),
            refresh: Arc::new(AtomicBool::new(false)),
        };
        assert!(flags.take_skip());
        assert!(!flags.take_skip());
        assert!(!flags.stop_requested());
    }
}
