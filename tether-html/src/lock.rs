//! Per-document FIFO lock shared by worker threads and the event loop.
//!
//! Worker threads block on a oneshot until they reach the head of the queue;
//! event-loop tasks await the same oneshot, so the loop thread itself never
//! blocks. Both kinds of callers share one queue and are served strictly in
//! arrival order.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tokio::sync::oneshot;

use crate::error::LockError;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    Thread(ThreadId),
    Task(u64),
}

/// Proof that the current code runs on a worker thread, not the event loop.
///
/// Not `Send`: the context is tied to the thread that created it.
#[derive(Debug)]
pub struct WorkerContext {
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl WorkerContext {
    pub fn current() -> Result<Self, LockError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(LockError::OnEventLoop);
        }
        Ok(Self {
            thread: thread::current().id(),
            _not_send: PhantomData,
        })
    }

    pub fn owner(&self) -> LockOwner {
        LockOwner::Thread(self.thread)
    }
}

/// Identity of one logical task on the event loop.
#[derive(Debug)]
pub struct LoopTask {
    id: u64,
}

impl LoopTask {
    pub fn new() -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn owner(&self) -> LockOwner {
        LockOwner::Task(self.id)
    }
}

impl Default for LoopTask {
    fn default() -> Self {
        Self::new()
    }
}

struct Waiter {
    owner: LockOwner,
    holds: usize,
    wake: Option<oneshot::Sender<()>>,
}

struct LockInner {
    queue: Mutex<VecDeque<Waiter>>,
    passthrough: bool,
}

/// Re-entrant FIFO lock scoped to a single document.
#[derive(Clone)]
pub struct DocumentLock {
    inner: Arc<LockInner>,
}

enum Acquire {
    Held,
    Wait(oneshot::Receiver<()>),
}

impl DocumentLock {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A lock that never blocks, for contexts without an event loop.
    pub fn passthrough() -> Self {
        Self::build(true)
    }

    fn build(passthrough: bool) -> Self {
        Self {
            inner: Arc::new(LockInner {
                queue: Mutex::new(VecDeque::new()),
                passthrough,
            }),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.passthrough
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Waiter>> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of holders plus waiters.
    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_locked(&self) -> bool {
        !self.queue().is_empty()
    }

    pub fn holder(&self) -> Option<LockOwner> {
        self.queue().front().map(|w| w.owner)
    }

    fn enqueue(&self, owner: LockOwner) -> Acquire {
        let mut queue = self.queue();
        if let Some(head) = queue.front_mut() {
            if head.owner == owner {
                head.holds += 1;
                return Acquire::Held;
            }
        } else {
            queue.push_back(Waiter {
                owner,
                holds: 1,
                wake: None,
            });
            return Acquire::Held;
        }
        let (tx, rx) = oneshot::channel();
        queue.push_back(Waiter {
            owner,
            holds: 1,
            wake: Some(tx),
        });
        Acquire::Wait(rx)
    }

    /// Hand the lock to the first live waiter. Caller holds the queue mutex.
    fn wake_head(queue: &mut VecDeque<Waiter>) {
        while let Some(head) = queue.front_mut() {
            match head.wake.take() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                    // receiver is gone: the waiter gave up
                    queue.pop_front();
                }
                None => return,
            }
        }
    }

    fn release(&self, owner: LockOwner) {
        let mut queue = self.queue();
        let Some(head) = queue.front_mut() else {
            return;
        };
        if head.owner != owner {
            tracing::error!(?owner, holder = ?head.owner, "lock released by a non-holder");
            return;
        }
        head.holds -= 1;
        if head.holds == 0 {
            queue.pop_front();
            Self::wake_head(&mut queue);
        }
    }

    fn abandon(&self, owner: LockOwner) {
        let mut queue = self.queue();
        if let Some(pos) = queue.iter().rposition(|w| w.owner == owner) {
            queue.remove(pos);
            if pos == 0 {
                Self::wake_head(&mut queue);
            }
        }
    }

    /// Blocking acquisition from a worker thread.
    pub fn lock(&self, ctx: &WorkerContext) -> LockGuard {
        if self.inner.passthrough {
            return LockGuard::noop(self);
        }
        let owner = ctx.owner();
        if let Acquire::Wait(rx) = self.enqueue(owner) {
            // The sender is only dropped unsent when this receiver is dead.
            let _ = rx.blocking_recv();
        }
        LockGuard::held(self, owner)
    }

    /// Cooperative acquisition from the event loop. Cancelling the returned
    /// future before it completes removes the waiter from the queue.
    pub async fn lock_async(&self, task: &LoopTask) -> LockGuard {
        if self.inner.passthrough {
            return LockGuard::noop(self);
        }
        let owner = task.owner();
        if let Acquire::Wait(rx) = self.enqueue(owner) {
            let mut pending = PendingAcquire {
                lock: self,
                owner,
                armed: true,
            };
            let _ = rx.await;
            pending.armed = false;
        }
        LockGuard::held(self, owner)
    }

    /// Hold the lock for one node helper call. Worker threads block as with
    /// [`DocumentLock::lock`]. Returns `None` on the event loop, where code
    /// holds the lock through [`DocumentLock::lock_async`] around its reads.
    pub fn lock_implicit(&self) -> Option<LockGuard> {
        if self.inner.passthrough {
            return None;
        }
        let ctx = WorkerContext::current().ok()?;
        Some(self.lock(&ctx))
    }

    /// Run `f` while holding the lock from a worker thread.
    pub fn with<R>(&self, ctx: &WorkerContext, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock(ctx);
        f()
    }
}

impl Default for DocumentLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DocumentLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentLock")
            .field("passthrough", &self.inner.passthrough)
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

struct PendingAcquire<'a> {
    lock: &'a DocumentLock,
    owner: LockOwner,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.abandon(self.owner);
        }
    }
}

/// Releases one hold when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: DocumentLock,
    owner: Option<LockOwner>,
}

impl LockGuard {
    fn held(lock: &DocumentLock, owner: LockOwner) -> Self {
        Self {
            lock: lock.clone(),
            owner: Some(owner),
        }
    }

    fn noop(lock: &DocumentLock) -> Self {
        Self {
            lock: lock.clone(),
            owner: None,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            self.lock.release(owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reentrant_worker() {
        let lock = DocumentLock::new();
        let ctx = WorkerContext::current().unwrap();
        let outer = lock.lock(&ctx);
        let inner = lock.lock(&ctx);
        assert_eq!(lock.queue_len(), 1);
        drop(inner);
        assert!(lock.is_locked());
        drop(outer);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_worker_context_rejected_on_loop() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = rt.block_on(async { WorkerContext::current().map(|_| ()) });
        assert_eq!(result, Err(LockError::OnEventLoop));
    }

    #[test]
    fn test_passthrough_never_queues() {
        let lock = DocumentLock::passthrough();
        let ctx = WorkerContext::current().unwrap();
        let _a = lock.lock(&ctx);
        assert_eq!(lock.queue_len(), 0);
    }

    #[test]
    fn test_worker_waits_for_holder() {
        let lock = DocumentLock::new();
        let ctx = WorkerContext::current().unwrap();
        let guard = lock.lock(&ctx);
        let other = lock.clone();
        let waiter = std::thread::spawn(move || {
            let ctx = WorkerContext::current().unwrap();
            let _g = other.lock(&ctx);
            other.holder()
        });
        while lock.queue_len() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(guard);
        let holder = waiter.join().unwrap();
        assert!(matches!(holder, Some(LockOwner::Thread(_))));
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_cancelled_async_waiter_leaves_queue() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let lock = DocumentLock::new();
        let ctx = WorkerContext::current().unwrap();
        let guard = lock.lock(&ctx);
        let timed_out = rt.block_on(async {
            let task = LoopTask::new();
            tokio::time::timeout(Duration::from_millis(10), lock.lock_async(&task))
                .await
                .is_err()
        });
        assert!(timed_out);
        assert_eq!(lock.queue_len(), 1);
        drop(guard);
        assert_eq!(lock.queue_len(), 0);
    }
}
