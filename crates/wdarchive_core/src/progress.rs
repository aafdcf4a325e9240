use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Receives user-facing progress lines, one per call.
pub trait ProgressSink {
    fn report(&self, message: &str);
}

pub struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn report(&self, message: &str) {
        println!("{message}");
    }
}

pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _message: &str) {}
}

/// Cooperative cancellation flag, checked between commits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
