//! Scripted invocation failures.
//!
//! Wraps an [`InvocationService`] and fails chosen partitions before handing
//! requests to the inner service. Used to exercise retry and give-up paths
//! deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::backend::serverless::{
    InvocationFailure, InvocationRequest, InvocationResponse, InvocationService, ServerlessLimits,
};

#[derive(Debug)]
pub struct FaultyInvoker<S> {
    inner: S,
    queued: Mutex<BTreeMap<usize, VecDeque<InvocationFailure>>>,
    sticky: BTreeMap<usize, InvocationFailure>,
    calls: AtomicUsize,
}

impl<S: InvocationService> FaultyInvoker<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            queued: Mutex::new(BTreeMap::new()),
            sticky: BTreeMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next attempts of `partition` with `failures`, in order.
    pub fn fail_next(self, partition: usize, failures: impl IntoIterator<Item = InvocationFailure>) -> Self {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(partition)
            .or_default()
            .extend(failures);
        self
    }

    /// Fail every attempt of `partition`.
    pub fn fail_always(mut self, partition: usize, failure: InvocationFailure) -> Self {
        self.sticky.insert(partition, failure);
        self
    }

    /// Attempts seen so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<S: InvocationService> InvocationService for FaultyInvoker<S> {
    fn limits(&self, memory_mb: u64) -> ServerlessLimits {
        self.inner.limits(memory_mb)
    }

    fn invoke(&self, req: &InvocationRequest) -> Result<InvocationResponse, InvocationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(f) = self.sticky.get(&req.partition) {
            return Err(f.clone());
        }
        let next = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&req.partition)
            .and_then(VecDeque::pop_front);
        match next {
            Some(f) => Err(f),
            None => self.inner.invoke(req),
        }
    }
}
