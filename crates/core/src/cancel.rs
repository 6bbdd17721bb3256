//! Cooperative cancellation for long-running atomic operations.
//!
//! Merges and rollbacks run on the blocking pool; they poll a
//! [`CancellationToken`] between entities and before commit.

pub use tokio_util::sync::CancellationToken;

use crate::errors::EngineError;

/// Checkpoint polled by blocking engine work.
pub trait Checkpoint {
    /// Fail with [`EngineError::Cancelled`] once cancellation was requested.
    fn checkpoint(&self) -> Result<(), EngineError>;
}

impl Checkpoint for CancellationToken {
    fn checkpoint(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_after_cancel() {
        let token = CancellationToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_child_token_sees_parent_cancel() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        parent.cancel();
        assert!(matches!(child.checkpoint(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_drop_guard_cancels_unless_disarmed() {
        let token = CancellationToken::new();
        drop(token.clone().drop_guard());
        assert!(token.is_cancelled());

        let token = CancellationToken::new();
        let _ = token.clone().drop_guard().disarm();
        assert!(token.checkpoint().is_ok());
    }
}
