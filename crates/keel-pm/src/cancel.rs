//! Cancellation seam for long-running fetches
//!
//! Network and git operations poll a [`Cancellation`] so that a caller whose
//! work was abandoned stops waiting on them.

/// Something that can report whether the surrounding work was abandoned.
pub trait Cancellation: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Never cancels. Used by the command line, where ^C terminates the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl Cancellation for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl Cancellation for std::sync::atomic::AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(std::sync::atomic::Ordering::Acquire)
    }
}
