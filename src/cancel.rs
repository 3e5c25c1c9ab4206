//! Cancellation scope shared by every stage of one transfer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TransferError;

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe from any thread; calling it more than once is a no-op.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `TransferError::Cancelled` once the scope has been cancelled.
    pub fn check(&self) -> Result<(), TransferError> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// True when both tokens share the same flag.
    pub fn same_scope(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}
