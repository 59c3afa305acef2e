//! [`Executor`] implementation on top of tokio.

use std::{error::Error, future::Future};

use tokio::runtime::Handle;

use super::{Executor, JoinHandle};

impl<R: Send + 'static> JoinHandle<R> for tokio::task::JoinHandle<R> {
    async fn join(self) -> Result<R, Box<dyn Error + Send + Sync>> {
        self.await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)
    }
}

/// [`Executor`] backed by the ambient tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Executor spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Default for TokioExecutor {
    /// Captures the current runtime; panics outside a tokio context.
    fn default() -> Self {
        Self {
            handle: Handle::current(),
        }
    }
}

impl Executor for TokioExecutor {
    type JoinHandle<R>
        = tokio::task::JoinHandle<R>
    where
        R: Send + 'static;

    fn spawn<F>(&self, future: F) -> Self::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}
