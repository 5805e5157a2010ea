//! Operation ids, the registry of in-flight operations, and the handles
//! callers use to wait on or cancel them.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchQueue;
use crate::error::{BackendError, BackendResult};

/// Backend-unique operation id. Never zero.
pub type OpId = u32;

/// Raw result payload of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    Text(String),
    List(Vec<String>),
}

/// Conversion from a [`Reply`] into the typed value an
/// [`OperationHandle`] resolves to.
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> BackendResult<Self>;
}

impl FromReply for () {
    fn from_reply(_reply: Reply) -> BackendResult<Self> {
        Ok(())
    }
}

impl FromReply for String {
    fn from_reply(reply: Reply) -> BackendResult<Self> {
        match reply {
            Reply::Text(text) => Ok(text),
            other => Err(BackendError::Other(format!(
                "Expected text reply, got {other:?}"
            ))),
        }
    }
}

impl FromReply for Vec<String> {
    fn from_reply(reply: Reply) -> BackendResult<Self> {
        match reply {
            Reply::List(items) => Ok(items),
            Reply::Done => Ok(Vec::new()),
            Reply::Text(text) => Ok(vec![text]),
        }
    }
}

pub(crate) type Completer = oneshot::Sender<BackendResult<Reply>>;

/// Bookkeeping for an operation between submission and completion.
pub struct PendingOperation {
    cancel: CancellationToken,
    blocking: bool,
    completer: Completer,
}

impl PendingOperation {
    pub(crate) fn new(cancel: CancellationToken, blocking: bool, completer: Completer) -> Self {
        PendingOperation {
            cancel,
            blocking,
            completer,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Deliver the result. A caller that dropped its handle is not an error.
    pub fn complete(self, result: BackendResult<Reply>) {
        let _ = self.completer.send(result);
    }
}

struct RegistryState {
    next_opid: OpId,
    operations: HashMap<OpId, PendingOperation>,
}

/// Map from opid to pending operation.
///
/// Each registered operation is claimed exactly once: whoever claims it owns
/// the right to deliver its result, and a second claim fails.
pub struct OperationRegistry {
    state: Mutex<RegistryState>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        OperationRegistry {
            state: Mutex::new(RegistryState {
                next_opid: 1,
                operations: HashMap::new(),
            }),
        }
    }

    /// Register an operation under a fresh opid.
    pub fn stash(&self, operation: PendingOperation) -> OpId {
        let mut state = self.state.lock();
        let mut opid = state.next_opid;
        while opid == 0 || state.operations.contains_key(&opid) {
            opid = opid.wrapping_add(1);
        }
        state.next_opid = opid.wrapping_add(1);
        state.operations.insert(opid, operation);
        opid
    }

    /// Remove and return the operation, transferring ownership of its result.
    pub fn claim(&self, opid: OpId) -> BackendResult<PendingOperation> {
        self.state
            .lock()
            .operations
            .remove(&opid)
            .ok_or(BackendError::UnknownOperation(opid))
    }

    pub fn cancel_token(&self, opid: OpId) -> Option<CancellationToken> {
        self.state
            .lock()
            .operations
            .get(&opid)
            .map(|op| op.cancel.clone())
    }

    /// Cancel every registered operation's token.
    pub fn cancel_all(&self) {
        for op in self.state.lock().operations.values() {
            op.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller-side handle to a submitted operation.
///
/// Await the result with [`OperationHandle::wait`]. Dropping the handle does
/// not cancel the operation.
pub struct OperationHandle<T> {
    opid: OpId,
    cancel: CancellationToken,
    receiver: oneshot::Receiver<BackendResult<Reply>>,
    queue: Weak<DispatchQueue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromReply> OperationHandle<T> {
    pub(crate) fn new(
        opid: OpId,
        cancel: CancellationToken,
        receiver: oneshot::Receiver<BackendResult<Reply>>,
        queue: Weak<DispatchQueue>,
    ) -> Self {
        OperationHandle {
            opid,
            cancel,
            receiver,
            queue,
            _marker: PhantomData,
        }
    }

    pub fn opid(&self) -> OpId {
        self.opid
    }

    /// Request cancellation. A queued operation completes with
    /// [`BackendError::Cancelled`] without ever running; a running one sees
    /// its token fire at its next suspension point.
    pub fn cancel(&self) {
        match self.queue.upgrade() {
            Some(queue) => queue.cancel(self.opid),
            None => self.cancel.cancel(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> BackendResult<T> {
        match self.receiver.await {
            Ok(result) => T::from_reply(result?),
            // Completer dropped without a result: the backend went away
            Err(_) => Err(BackendError::Cancelled),
        }
    }
}
