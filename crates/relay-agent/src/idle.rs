//! Rolling idle window for the streaming stage.
//!
//! `IdleTimeout` is a deadline that every sign of life pushes forward. The
//! streaming call is raced against [`IdleTimeout::expired`]; if the provider
//! stays silent for a full window the race is lost and the turn fails with
//! an idle classification, separate from the stage's absolute bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    At(Instant),
    Cleared,
}

struct Inner {
    window: Duration,
    message: String,
    deadline: watch::Sender<Deadline>,
    fired: AtomicBool,
}

/// Cheaply cloneable handle; all clones share one deadline.
#[derive(Clone)]
pub struct IdleTimeout {
    inner: Arc<Inner>,
}

impl IdleTimeout {
    /// Start a window of `window` from now.
    pub fn new(window: Duration, message: impl Into<String>) -> Self {
        let (deadline, _) = watch::channel(Deadline::At(Instant::now() + window));
        Self {
            inner: Arc::new(Inner {
                window,
                message: message.into(),
                deadline,
                fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Drop the pending deadline and schedule a fresh full window.
    ///
    /// No effect after the window has fired or after [`cleanup`](Self::cleanup).
    pub fn reset_timeout(&self) {
        if self.has_fired() {
            return;
        }
        let next = Instant::now() + self.inner.window;
        self.inner.deadline.send_if_modified(|d| match d {
            Deadline::Cleared => false,
            Deadline::At(_) => {
                *d = Deadline::At(next);
                true
            }
        });
    }

    /// Cancel the pending deadline for good. Must run on every exit path;
    /// [`IdleGuard`] does it on drop.
    pub fn cleanup(&self) {
        self.inner.deadline.send_replace(Deadline::Cleared);
        debug!("idle timeout cleaned up");
    }

    pub fn is_cleaned_up(&self) -> bool {
        *self.inner.deadline.borrow() == Deadline::Cleared
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Guard that calls [`cleanup`](Self::cleanup) when dropped.
    pub fn guard(&self) -> IdleGuard {
        IdleGuard(self.clone())
    }

    /// Resolves with the idle error once a window elapses without a reset.
    /// Never resolves after cleanup.
    pub async fn expired(&self) -> PipelineError {
        let mut rx = self.inner.deadline.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            let when = match current {
                Deadline::Cleared => std::future::pending::<Instant>().await,
                Deadline::At(when) => when,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(when) => {
                    // A reset may have landed between wake-up and now.
                    if *self.inner.deadline.borrow() != Deadline::At(when) {
                        continue;
                    }
                    if !self.inner.fired.swap(true, Ordering::SeqCst) {
                        warn!(
                            window_ms = self.inner.window.as_millis() as u64,
                            "{}", self.inner.message
                        );
                    }
                    return self.error();
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    fn error(&self) -> PipelineError {
        PipelineError::IdleTimeout {
            message: self.inner.message.clone(),
            window_ms: self.inner.window.as_millis() as u64,
        }
    }
}

/// Releases the idle timer when the owning scope exits, however it exits.
pub struct IdleGuard(IdleTimeout);

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.0.cleanup();
    }
}
