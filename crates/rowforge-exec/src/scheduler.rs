//! Worker pool for running the partitions of one stage.
//!
//! Tasks go through a `crossbeam-channel` queue drained by a fixed number of
//! scoped threads; results come back on a second channel in completion order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::unbounded;

use crate::error::{ExecError, Result};

/// Shared flag that stops a running job from taking on new partitions.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Apply `work` to every task on at most `workers` threads.
///
/// Returns `(task index, result)` pairs in completion order. Once `cancel`
/// fires, workers finish what they hold, take nothing new, and the whole
/// call reports [`ExecError::Cancelled`].
pub fn run_pool<T, R, F>(
    tasks: Vec<T>,
    workers: usize,
    cancel: &CancelHandle,
    work: F,
) -> Result<Vec<(usize, R)>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    let total = tasks.len();
    if total == 0 {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        return Ok(Vec::new());
    }
    let (task_tx, task_rx) = unbounded::<(usize, T)>();
    let (done_tx, done_rx) = unbounded::<(usize, R)>();
    for task in tasks.into_iter().enumerate() {
        // the receiver is alive until the scope below ends
        let _ = task_tx.send(task);
    }
    drop(task_tx);

    let work = &work;
    std::thread::scope(|s| {
        for _ in 0..workers.clamp(1, total) {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            s.spawn(move || {
                while !cancel.is_cancelled() {
                    let Ok((i, task)) = task_rx.recv() else {
                        break;
                    };
                    if done_tx.send((i, work(i, task))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(done_tx);

    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }
    let done: Vec<(usize, R)> = done_rx.try_iter().collect();
    tracing::trace!(tasks = total, done = done.len(), "pool drained");
    Ok(done)
}
