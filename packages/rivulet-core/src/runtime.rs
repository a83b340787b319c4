//! Task spawning abstraction for runtime independence.
//!
//! The scheduler spawns one cooperative task per filter. Going through
//! [`TaskSpawner`] keeps the core library independent of how the embedder
//! runs tokio (standalone runtime, shared runtime, pinned threads).

use futures::future::BoxFuture;

/// Abstraction for spawning background tasks.
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future to run in the background.
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Default spawner using the ambient tokio runtime.
pub struct TokioSpawner;

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn tokio_spawner_runs_tasks() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        TokioSpawner.spawn(Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        }));
        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
