//! Cooperative run control: cancellation and pause.
//!
//! Cancellation uses `tokio_util` tokens arranged in two levels. The global
//! stop token ends every run (user stop, disk full); each blog run gets a
//! child token so a single run can be cancelled without touching the others.
//! Pause is a shared `watch` flag that workers poll between posts, pages and
//! queue items.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared pause flag.
#[derive(Debug, Clone)]
pub struct PauseToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseToken {
    /// Creates an un-paused token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Pauses every holder of this token.
    pub fn pause(&self) {
        self.tx.send_replace(true);
        info!("paused");
    }

    /// Resumes every holder of this token.
    pub fn resume(&self) {
        self.tx.send_replace(false);
        info!("resumed");
    }

    /// Current state.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits while paused.
    ///
    /// Returns `false` when `cancel` fired before the pause was lifted.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> bool {
        if !self.is_paused() {
            return !cancel.is_cancelled();
        }
        debug!("waiting while paused");
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            result = rx.wait_for(|paused| !*paused) => result.is_ok(),
        }
    }
}

/// Stop and pause signals handed to one blog run.
#[derive(Debug, Clone)]
pub struct RunControl {
    global: CancellationToken,
    run: CancellationToken,
    pause: PauseToken,
}

impl RunControl {
    /// Standalone control with its own global token.
    #[must_use]
    pub fn new() -> Self {
        Self::child_of(&CancellationToken::new(), PauseToken::new())
    }

    /// Control for one run below the application-wide `global` token.
    #[must_use]
    pub fn child_of(global: &CancellationToken, pause: PauseToken) -> Self {
        Self {
            global: global.clone(),
            run: global.child_token(),
            pause,
        }
    }

    /// Token cancelled when this run (or everything) is stopped.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.run
    }

    /// Pause flag.
    #[must_use]
    pub fn pause_token(&self) -> &PauseToken {
        &self.pause
    }

    /// True once this run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }

    /// Cancels this run only.
    pub fn cancel_run(&self) {
        self.run.cancel();
    }

    /// Stops every run sharing the global token.
    pub fn stop_all(&self) {
        self.global.cancel();
    }

    /// Waits while paused; `false` means the run was cancelled meanwhile.
    pub async fn checkpoint(&self) -> bool {
        self.pause.wait_while_paused(&self.run).await
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_checkpoint_passes_when_not_paused() {
        let control = RunControl::new();
        assert!(control.checkpoint().await);
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_resume() {
        let control = RunControl::new();
        control.pause_token().pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.pause_token().resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_returns_false_on_cancel_while_paused() {
        let control = RunControl::new();
        control.pause_token().pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        control.cancel_run();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_stop_all_cancels_every_child() {
        let global = CancellationToken::new();
        let a = RunControl::child_of(&global, PauseToken::new());
        let b = RunControl::child_of(&global, PauseToken::new());

        a.cancel_run();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());

        b.stop_all();
        assert!(b.is_cancelled());
        assert!(global.is_cancelled());
    }
}
