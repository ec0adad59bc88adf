//! First-outcome-wins race between watcher tasks.
//!
//! Each watcher runs in its own task and reports at most once into a
//! single-slot channel. The first report is returned; every other watcher is
//! then told to stop through a shared cancellation signal. A watcher that sees
//! the signal drops its in-flight future, which closes any connection the
//! future held open. A watcher that completes after the winner has its result
//! discarded.

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// A named future racing against others.
pub struct Watcher<T> {
    name: &'static str,
    task: BoxFuture<'static, T>,
}

impl<T> Watcher<T> {
    /// Wrap `task` as a watcher called `name`.
    pub fn new(name: &'static str, task: BoxFuture<'static, T>) -> Self {
        Self { name, task }
    }
}

/// Run all watchers and return the first outcome.
///
/// Returns `None` only if every watcher ended without reporting, which
/// happens when all of them panic.
pub async fn race<T>(watchers: Vec<Watcher<T>>) -> Option<T>
where
    T: Send + 'static,
{
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(1);

    for watcher in watchers {
        spawn_watcher(watcher, cancel_rx.clone(), outcome_tx.clone());
    }
    drop(outcome_tx);

    let first = outcome_rx.recv().await;
    cancel_tx.send_replace(true);
    first
}

fn spawn_watcher<T>(watcher: Watcher<T>, mut cancel: watch::Receiver<bool>, outcome: mpsc::Sender<T>)
where
    T: Send + 'static,
{
    let Watcher { name, task } = watcher;

    tokio::spawn(async move {
        tokio::select! {
            biased;

            _ = cancel.changed() => {
                debug!(watcher = name, "Watcher cancelled");
            }

            result = task => {
                if *cancel.borrow() {
                    debug!(watcher = name, "Watcher finished after cancellation, outcome discarded");
                    return;
                }
                if outcome.try_send(result).is_err() {
                    debug!(watcher = name, "Watcher lost the race, outcome discarded");
                } else {
                    debug!(watcher = name, "Watcher reported");
                }
            }
        }
    });
}
