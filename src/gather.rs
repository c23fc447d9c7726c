//! Bounded scatter-gather primitive.
//!
//! Tasks are spawned as they are added; [`GatherGroup::join`] waits for all
//! of them (or a group timeout) and returns results in add-order. A failing
//! task never cancels its siblings; a group timeout cancels everything and
//! substitutes [`GatherError::Timeout`] into every unfinished slot.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum GatherError {
    #[error("group timed out after {0:.1}s")]
    Timeout(f64),
    #[error("task panicked or was cancelled: {0}")]
    Join(String),
}

/// Collects concurrently running tasks and their results.
pub struct GatherGroup<T> {
    handles: Vec<JoinHandle<T>>,
    timeout: Option<Duration>,
}

impl<T: Send + 'static> GatherGroup<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handles: Vec::new(),
            timeout: Some(timeout),
        }
    }

    /// Spawn a task into the group. Execution starts immediately.
    pub fn add<F>(&mut self, fut: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.handles.push(tokio::spawn(fut));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task, honoring the group timeout.
    pub async fn join(self) -> Vec<Result<T, GatherError>> {
        let count = self.handles.len();
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let gather = async {
            let joined = futures::future::join_all(self.handles).await;
            joined
                .into_iter()
                .map(|res| res.map_err(|err| GatherError::Join(err.to_string())))
                .collect::<Vec<_>>()
        };

        match self.timeout {
            None => gather.await,
            Some(timeout) => match tokio::time::timeout(timeout, gather).await {
                Ok(results) => results,
                Err(_) => {
                    for abort in aborts {
                        abort.abort();
                    }
                    (0..count)
                        .map(|_| Err(GatherError::Timeout(timeout.as_secs_f64())))
                        .collect()
                }
            },
        }
    }
}

impl<T: Send + 'static> Default for GatherGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
