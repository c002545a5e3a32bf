use bos_error::{ToolboxError, ToolboxResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared user-interrupt flag. Set from the Ctrl+C handler, polled between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once the flag is set.
    pub fn check(&self) -> ToolboxResult<()> {
        if self.is_cancelled() {
            Err(ToolboxError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let flag = CancelFlag::new();
        let handler_copy = flag.clone();
        assert!(flag.check().is_ok());
        handler_copy.cancel();
        assert!(flag.check().unwrap_err().is_interrupt());
    }
}
