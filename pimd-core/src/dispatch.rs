//! FIFO dispatch of backend operations onto tokio tasks.
//!
//! Non-blocking operations run concurrently up to the worker limit. A
//! blocking operation waits for everything in flight to finish, then runs
//! alone: nothing else is dispatched until its result has been claimed.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{BackendError, BackendResult};
use crate::operation::{FromReply, OpId, OperationHandle, OperationRegistry, PendingOperation, Reply};

pub type DispatchFuture = BoxFuture<'static, BackendResult<Reply>>;

/// Work to run once the node is dispatched. Receives the operation's
/// cancellation token.
pub type DispatchFn = Box<dyn FnOnce(CancellationToken) -> DispatchFuture + Send>;

/// Box an async closure into a [`DispatchFn`].
pub fn dispatch_fn<F, Fut>(f: F) -> DispatchFn
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = BackendResult<Reply>> + Send + 'static,
{
    Box::new(move |cancel| f(cancel).boxed())
}

struct DispatchNode {
    opid: OpId,
    blocking: bool,
    cancel: CancellationToken,
    dispatch: DispatchFn,
}

struct QueueState {
    pending: VecDeque<DispatchNode>,
    /// Opid of the blocking operation currently holding the queue.
    blocked: Option<OpId>,
    running: usize,
    closed: bool,
}

pub struct DispatchQueue {
    state: Mutex<QueueState>,
    registry: OperationRegistry,
    max_workers: usize,
    runtime: Handle,
}

impl DispatchQueue {
    pub fn new(max_workers: usize, runtime: Handle) -> Arc<Self> {
        Arc::new(DispatchQueue {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                blocked: None,
                running: 0,
                closed: false,
            }),
            registry: OperationRegistry::new(),
            max_workers: max_workers.max(1),
            runtime,
        })
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Register and enqueue an operation, then dispatch whatever can run.
    pub fn submit<T: FromReply>(
        self: &Arc<Self>,
        blocking: bool,
        dispatch: DispatchFn,
    ) -> OperationHandle<T> {
        let cancel = CancellationToken::new();
        let (completer, receiver) = oneshot::channel();
        let opid = self
            .registry
            .stash(PendingOperation::new(cancel.clone(), blocking, completer));

        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                true
            } else {
                state.pending.push_back(DispatchNode {
                    opid,
                    blocking,
                    cancel: cancel.clone(),
                    dispatch,
                });
                false
            }
        };

        if rejected {
            self.complete(opid, Err(BackendError::Cancelled));
        } else {
            trace!(opid, blocking, "operation queued");
            self.dispatch_all();
        }

        OperationHandle::new(opid, cancel, receiver, Arc::downgrade(self))
    }

    /// Try to start the node at the head of the queue. Returns `false` when
    /// the queue is empty, held by a blocking operation, or out of workers.
    pub fn dispatch_next(self: &Arc<Self>) -> bool {
        let node = {
            let mut state = self.state.lock();
            if state.blocked.is_some() || state.running >= self.max_workers {
                return false;
            }
            match state.pending.front() {
                None => return false,
                Some(head) if head.blocking && state.running > 0 => return false,
                Some(_) => {}
            }
            let Some(node) = state.pending.pop_front() else {
                return false;
            };
            if node.blocking {
                state.blocked = Some(node.opid);
            }
            state.running += 1;
            node
        };

        trace!(opid = node.opid, blocking = node.blocking, "operation dispatched");
        let queue = Arc::clone(self);
        self.runtime.spawn(async move { queue.run(node).await });
        true
    }

    pub fn dispatch_all(self: &Arc<Self>) {
        while self.dispatch_next() {}
    }

    async fn run(self: Arc<Self>, node: DispatchNode) {
        let DispatchNode {
            opid,
            cancel,
            dispatch,
            ..
        } = node;

        let result = if cancel.is_cancelled() {
            Err(BackendError::Cancelled)
        } else {
            let work = dispatch(cancel.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BackendError::Cancelled),
                result = work => result,
            }
        };

        self.complete(opid, result);
        self.finish(opid);
    }

    fn complete(&self, opid: OpId, result: BackendResult<Reply>) {
        match self.registry.claim(opid) {
            Ok(pending) => pending.complete(result),
            Err(_) => trace!(opid, "operation already claimed"),
        }
    }

    fn finish(self: &Arc<Self>, opid: OpId) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            if state.blocked == Some(opid) {
                state.blocked = None;
            }
        }
        self.dispatch_all();
    }

    /// Cancel an operation by opid. A still-queued node is removed and
    /// completed with [`BackendError::Cancelled`] right away.
    pub fn cancel(self: &Arc<Self>, opid: OpId) {
        if let Some(token) = self.registry.cancel_token(opid) {
            token.cancel();
        }

        let removed = {
            let mut state = self.state.lock();
            state
                .pending
                .iter()
                .position(|node| node.opid == opid)
                .and_then(|index| state.pending.remove(index))
        };

        if let Some(node) = removed {
            debug!(opid = node.opid, "cancelled queued operation");
            self.complete(node.opid, Err(BackendError::Cancelled));
            // The removed node may have been holding back the queue head
            self.dispatch_all();
        }
    }

    /// Refuse new work, cancel everything in flight and fail every queued
    /// node with [`BackendError::Cancelled`].
    pub fn shutdown(&self) {
        let drained: Vec<DispatchNode> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };

        self.registry.cancel_all();
        for node in drained {
            self.complete(node.opid, Err(BackendError::Cancelled));
        }
    }

    pub fn queued(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sleeper(log: Arc<Mutex<Vec<String>>>, name: &'static str, millis: u64) -> DispatchFn {
        dispatch_fn(move |_cancel| async move {
            log.lock().push(format!("start {name}"));
            tokio::time::sleep(Duration::from_millis(millis)).await;
            log.lock().push(format!("end {name}"));
            Ok(Reply::Text(name.to_string()))
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocking_operation_runs_alone() {
        let queue = DispatchQueue::new(4, Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        let a: OperationHandle<String> = queue.submit(false, sleeper(log.clone(), "a", 30));
        let b: OperationHandle<String> = queue.submit(true, sleeper(log.clone(), "b", 30));
        let c: OperationHandle<String> = queue.submit(false, sleeper(log.clone(), "c", 5));

        assert_eq!(a.wait().await.unwrap(), "a");
        assert_eq!(b.wait().await.unwrap(), "b");
        assert_eq!(c.wait().await.unwrap(), "c");

        let log = log.lock().clone();
        assert_eq!(
            log,
            vec!["start a", "end a", "start b", "end b", "start c", "end c"],
            "blocking op must not overlap with anything"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_non_blocking_operations_overlap() {
        let queue = DispatchQueue::new(4, Handle::current());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<OperationHandle<()>> = (0..3)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                queue.submit(
                    false,
                    dispatch_fn(move |_| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(Reply::Done)
                    }),
                )
            })
            .collect();

        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serial_queue_runs_one_at_a_time() {
        let queue = DispatchQueue::new(1, Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        let a: OperationHandle<String> = queue.submit(false, sleeper(log.clone(), "a", 20));
        let b: OperationHandle<String> = queue.submit(false, sleeper(log.clone(), "b", 5));
        b.wait().await.unwrap();
        a.wait().await.unwrap();

        assert_eq!(log.lock().clone(), vec!["start a", "end a", "start b", "end b"]);
    }

    #[tokio::test]
    async fn test_cancel_queued_operation_never_runs() {
        let queue = DispatchQueue::new(1, Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first: OperationHandle<String> = queue.submit(true, sleeper(log.clone(), "first", 20));
        let second: OperationHandle<String> = queue.submit(false, sleeper(log.clone(), "second", 1));
        second.cancel();

        assert_eq!(second.wait().await, Err(BackendError::Cancelled));
        assert_eq!(first.wait().await.unwrap(), "first");
        assert!(!log.lock().iter().any(|entry| entry.contains("second")));
        assert!(queue.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_operation() {
        let queue = DispatchQueue::new(2, Handle::current());
        let handle: OperationHandle<()> = queue.submit(
            false,
            dispatch_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Reply::Done)
            }),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("cancellation should be prompt");
        assert_eq!(result, Err(BackendError::Cancelled));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_and_new_work() {
        let queue = DispatchQueue::new(1, Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        let running: OperationHandle<String> = queue.submit(true, sleeper(log.clone(), "run", 20));
        let queued: OperationHandle<String> = queue.submit(false, sleeper(log.clone(), "queued", 1));
        queue.shutdown();

        assert_eq!(queued.wait().await, Err(BackendError::Cancelled));
        assert_eq!(running.wait().await, Err(BackendError::Cancelled));

        let late: OperationHandle<String> = queue.submit(false, sleeper(log.clone(), "late", 1));
        assert_eq!(late.wait().await, Err(BackendError::Cancelled));
        assert_eq!(queue.queued(), 0);
    }
}
