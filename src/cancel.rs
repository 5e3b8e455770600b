use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{LinkageError, Phase, Result};

/// Cooperative stop flag shared between a caller and running work.
///
/// Cloning hands out another view of the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Interrupted)` once cancelled.
    pub fn check(&self, phase: Phase) -> Result<()> {
        if self.is_cancelled() {
            Err(LinkageError::Interrupted { phase })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let view = token.clone();
        assert!(view.check(Phase::Score).is_ok());
        token.cancel();
        assert!(view.is_cancelled());
        assert!(matches!(
            view.check(Phase::Block),
            Err(LinkageError::Interrupted {
                phase: Phase::Block
            })
        ));
    }
}
