//! Cancellation and deadlines for individual operations.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Carries a cancellation signal and an optional deadline into every
/// operation. Cloning shares the signal; [`Context::child`] derives one that
/// is canceled with its parent but can also be canceled alone.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never canceled and has no deadline
    pub fn background() -> Context {
        Context::default()
    }

    pub fn with_timeout(timeout: Duration) -> Context {
        Context::background().timeout(timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Context {
        Context::background().deadline(deadline)
    }

    /// Derived context with the earlier of the current deadline and `now + timeout`
    pub fn timeout(&self, timeout: Duration) -> Context {
        self.deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self, deadline: Instant) -> Context {
        Context {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    pub fn child(&self) -> Context {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Why the context is done, if it is
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            Some(Error::Canceled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Error::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is canceled or its deadline passes
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::Canceled,
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Error::Canceled
            }
        }
    }
}
