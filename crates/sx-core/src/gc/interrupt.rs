use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::GcError;

/// Cooperative cancellation flag checked at every loop iteration of a sweep.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<(), GcError> {
        if self.is_triggered() {
            Err(GcError::Interrupted)
        } else {
            Ok(())
        }
    }
}
