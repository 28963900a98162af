// Background Tasks - Fire-and-forget work spawned after a transaction commits
// Failures are logged and never reach the request that spawned them

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::core::{CommentId, PostId, UserId};

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task`, logging its error or panic instead of propagating it
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Reap finished tasks so the set does not grow without bound.
        while let Some(finished) = tasks.try_join_next() {
            log_join_result(finished);
        }
        tasks.spawn(async move {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "background task failed");
            }
        });
    }

    /// Number of tasks spawned and not yet reaped
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Wait for every in-flight task to finish
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        if !tasks.is_empty() {
            info!(pending = tasks.len(), "waiting for background tasks to complete");
        }
        while let Some(finished) = tasks.join_next().await {
            log_join_result(finished);
        }
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "background task panicked");
    }
}

/// Emitted once a new comment has been committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentCreated {
    pub comment_id: CommentId,
    pub post_id: PostId,
    pub parent: Option<CommentId>,
    pub author: UserId,
}

/// Hook for out-of-band reactions to new comments (mail, push, feeds)
#[async_trait]
pub trait CommentNotifier: Send + Sync {
    async fn comment_created(&self, event: &CommentCreated) -> anyhow::Result<()>;
}

/// Default notifier: records the event in the log
pub struct LogNotifier;

#[async_trait]
impl CommentNotifier for LogNotifier {
    async fn comment_created(&self, event: &CommentCreated) -> anyhow::Result<()> {
        info!(
            comment_id = %event.comment_id,
            post_id = %event.post_id,
            author = %event.author,
            "comment created"
        );
        Ok(())
    }
}
