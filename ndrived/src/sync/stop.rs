use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag handed to every long-running operation.
///
/// Checked at suspension points: after each chunk, between pair handlers and
/// before outbound calls.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    stopping: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_flags() {
        let token = StopToken::new();
        let clone = token.clone();
        token.stop();
        token.pause();
        assert!(clone.is_stopping());
        assert!(clone.is_paused());
        clone.resume();
        assert!(!token.is_paused());
    }
}
