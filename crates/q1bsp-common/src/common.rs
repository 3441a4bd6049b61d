// common.rs — console-style logging helpers and one-shot warning latches
//
// Everything funnels into the `log` facade; the host decides where it goes.

use std::sync::atomic::{AtomicBool, Ordering};

/// Normal console output.
pub fn com_printf(msg: &str) {
    log::info!("{}", msg.trim_end_matches('\n'));
}

/// Developer output (shown with `developer 1`).
pub fn com_dprintf(msg: &str) {
    log::debug!("{}", msg.trim_end_matches('\n'));
}

/// Second developer level, very chatty.
pub fn com_dprintf2(msg: &str) {
    log::trace!("{}", msg.trim_end_matches('\n'));
}

pub fn com_warning(msg: &str) {
    log::warn!("{}", msg.trim_end_matches('\n'));
}

// ============================================================
// One-shot warnings
// ============================================================

/// Latch for messages that must be printed once per owner (a model, a
/// cache) rather than every frame.
#[derive(Debug, Default)]
pub struct WarnOnce {
    fired: AtomicBool,
}

impl WarnOnce {
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Returns true the first time it is called after construction or reset.
    pub fn first(&self) -> bool {
        !self.fired.swap(true, Ordering::Relaxed)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.fired.store(false, Ordering::Relaxed);
    }
}

impl Clone for WarnOnce {
    fn clone(&self) -> Self {
        Self {
            fired: AtomicBool::new(self.has_fired()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_once_latches() {
        let w = WarnOnce::new();
        assert!(w.first());
        assert!(!w.first());
        assert!(w.has_fired());
        w.reset();
        assert!(w.first());
    }

    #[test]
    fn test_printf_wrappers_do_not_panic_without_logger() {
        com_printf("hello\n");
        com_dprintf("dev\n");
        com_dprintf2("dev2\n");
        com_warning("warn\n");
    }
}
