//! Runtime abstraction used to spawn background work such as the flush worker.

#[cfg(feature = "tokio")]
pub mod tokio;

use std::{error::Error, future::Future};

/// Awaitable handle to a spawned task.
pub trait JoinHandle<R> {
    /// Wait for the task to finish.
    fn join(self) -> impl Future<Output = Result<R, Box<dyn Error + Send + Sync>>> + Send;
}

/// Task spawner.
pub trait Executor: Send + Sync + 'static {
    /// Handle returned by [`Executor::spawn`].
    type JoinHandle<R>: JoinHandle<R> + Send
    where
        R: Send + 'static;

    /// Run `future` in the background.
    fn spawn<F>(&self, future: F) -> Self::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}
