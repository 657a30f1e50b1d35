//! Named background tasks sharing one cancellation token.
//!
//! Every I/O or pipeline task spawned for a connection lives in a
//! [`TaskSet`]. Shutdown cancels the token, waits up to a deadline for
//! tasks to notice, then aborts whatever is left, so teardown never
//! waits on a stalled peer.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct TaskSet {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Token the spawned futures should watch. Cloning is cheap.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn `fut` on the runtime under `name`.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "spawning");
        self.tasks.push((name, tokio::spawn(fut)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every task and wait at most `grace` for all of them.
    ///
    /// Returns how many tasks had to be aborted.
    pub async fn shutdown(&mut self, grace: Duration) -> usize {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => warn!(task = name, "task panicked"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "task did not stop in {grace:?}; aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
