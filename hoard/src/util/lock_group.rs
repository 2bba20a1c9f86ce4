//! Keyed read-write locks.
//!
//! Both the blob store (per content hash) and the targets (per request path)
//! serialize work through a registry of RW locks looked up by string key.
//! Equal keys always yield the same lock for as long as the group lives.

use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// A registry handing out a stable [RwLock] per string key.
///
/// Locks are created lazily on first lookup and shared between all callers
/// asking for the same key. The tokio lock type is used because its owned
/// guards are `Send`, which lets a guard travel inside a response body until
/// the body is dropped; acquisition from synchronous code goes through the
/// `blocking_*` methods.
#[derive(Clone, Default)]
pub struct LockGroup {
    group: Arc<DashMap<String, Arc<RwLock<()>>>>,
}

impl LockGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock registered for `key`, creating it if necessary.
    pub fn get(&self, key: &str) -> Arc<RwLock<()>> {
        self.group
            .entry(key.to_owned())
            .or_default()
            .value()
            .clone()
    }
}

/// Blocking acquisition of the owned guards, for use from synchronous code.
///
/// `tokio::sync::RwLock` only exposes blocking variants of its borrowing
/// `read`/`write` methods; the owned variants used here (so a guard can
/// travel inside a response body past the end of the current stack frame)
/// have no blocking counterpart, so this parks the calling thread on the
/// same future the async API awaits.
pub trait BlockingOwned {
    fn blocking_read_owned(self: Arc<Self>) -> OwnedRwLockReadGuard<()>;
    fn blocking_write_owned(self: Arc<Self>) -> OwnedRwLockWriteGuard<()>;
}

impl BlockingOwned for RwLock<()> {
    fn blocking_read_owned(self: Arc<Self>) -> OwnedRwLockReadGuard<()> {
        block_on(self.read_owned())
    }

    fn blocking_write_owned(self: Arc<Self>) -> OwnedRwLockWriteGuard<()> {
        block_on(self.write_owned())
    }
}

struct ThreadWaker {
    ready: Mutex<bool>,
    cvar: Condvar,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        *self.ready.lock().unwrap() = true;
        self.cvar.notify_one();
    }
}

fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = Box::pin(fut);
    let waker_data = Arc::new(ThreadWaker {
        ready: Mutex::new(false),
        cvar: Condvar::new(),
    });
    let waker = Waker::from(waker_data.clone());
    let mut cx = Context::from_waker(&waker);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => {
                let mut ready = waker_data.ready.lock().unwrap();
                while !*ready {
                    ready = waker_data.cvar.wait(ready).unwrap();
                }
                *ready = false;
            }
        }
    }
}
