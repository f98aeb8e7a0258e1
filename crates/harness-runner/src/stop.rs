use harness_core::{HarnessError, Result};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exit code reported for a run that was stopped on request (128 + SIGTERM).
pub const STOPPED_EXIT_CODE: i32 = 143;

/// Shared flag that asks in-flight runs to stop.
///
/// Cloning is cheap and every clone observes the same flag. Runners poll it
/// while a child process is alive and kill the child once it is raised.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Raises this flag on SIGTERM, SIGINT and SIGQUIT.
    ///
    /// A second termination signal while the flag is already raised exits the
    /// process with status 1 without waiting for cleanup.
    pub fn install_handlers(&self) -> Result<()> {
        for sig in TERM_SIGNALS {
            let context = || format!("installing handler for signal {}", sig);
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&self.requested))
                .map_err(|e| HarnessError::env(context(), e))?;
            flag::register(*sig, Arc::clone(&self.requested))
                .map_err(|e| HarnessError::env(context(), e))?;
        }
        tracing::debug!("termination signal handlers installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let stop = StopSignal::new();
        let seen = stop.clone();
        assert!(!seen.is_requested());
        stop.request();
        assert!(seen.is_requested());
    }
}
