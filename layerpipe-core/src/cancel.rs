//! # Cancellation
//!
//! Render work is cancelled cooperatively: whoever owns a job keeps a [`CancelToken`] and flips it,
//! while the job itself polls the token at its checkpoints (between tiles, between render passes)
//! and bails out with [`crate::compositor::RenderError::Cancelled`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}
impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// A token that can never be observed as cancelled by anyone else.
    /// Useful for synchronous callers that have nothing to cancel.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        // Relaxed is fine, it's a lone flag with no data published alongside it.
        self.flag.store(true, Ordering::Relaxed);
    }
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
    /// Checkpoint helper, for use with `?`.
    /// # Errors
    /// [`crate::compositor::RenderError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<(), crate::compositor::RenderError> {
        if self.is_cancelled() {
            Err(crate::compositor::RenderError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::CancelToken;
    #[test]
    fn clones_share_flag() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(b.check().is_ok());
        a.cancel();
        assert!(b.is_cancelled());
        assert!(b.check().is_err());
        // Fresh tokens are independent.
        assert!(!CancelToken::never().is_cancelled());
    }
}
