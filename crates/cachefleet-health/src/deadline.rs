//! Deadline enforcer — bounds cooperative background work by wall-clock time.
//!
//! [`do_within`] spawns the action and races its completion against a
//! timer. When the timer wins, the action's [`Terminate`] handle is raised
//! and [`DeadlineError::Timeout`] is returned. The action itself is never
//! aborted: it must poll its handle and stop touching shared state once
//! terminated.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Outcome of an action that did not report success.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineError {
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("action ended without reporting success")]
    Aborted,
}

/// Cancellation handle handed to every action run under a deadline.
#[derive(Debug, Clone)]
pub struct Terminate {
    rx: watch::Receiver<bool>,
}

impl Terminate {
    /// Whether the enforcer has asked the action to stop.
    pub fn is_terminated(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the enforcer asks the action to stop.
    ///
    /// Never resolves if the action completes normally, so it is safe to
    /// use as a `select!` arm next to the action's own work.
    pub async fn terminated(&mut self) {
        if self.rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `action` concurrently and wait at most `timeout` for it to finish.
///
/// Exactly one outcome is reported. On success the action's output is
/// returned and its [`Terminate`] handle is never raised; on timeout the
/// handle is always raised before returning.
pub async fn do_within<F, Fut, T>(timeout: Duration, action: F) -> Result<T, DeadlineError>
where
    F: FnOnce(Terminate) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (terminate_tx, terminate_rx) = watch::channel(false);
    let (success_tx, success_rx) = oneshot::channel();

    let work = action(Terminate { rx: terminate_rx });
    tokio::spawn(async move {
        let output = work.await;
        let _ = success_tx.send(output);
    });

    tokio::select! {
        biased;
        outcome = success_rx => outcome.map_err(|_| DeadlineError::Aborted),
        _ = tokio::time::sleep(timeout) => {
            let _ = terminate_tx.send(true);
            debug!(?timeout, "deadline exceeded, action terminated");
            Err(DeadlineError::Timeout(timeout))
        }
    }
}
