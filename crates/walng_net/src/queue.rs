use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::reactor::ReactorWaker;
use crate::transfer::TransferHandle;
use crate::CancellationToken;

#[derive(Debug)]
pub enum PendingItem {
    Enqueue(TransferHandle),
    Cancel(CancellationToken),
}

/// Inbox from caller threads to the worker: new transfers and cancellation
/// requests, kept in submission order. Every push wakes the reactor.
#[derive(Debug)]
pub struct PendingQueue {
    inbox: Mutex<Vec<PendingItem>>,
    waker: ReactorWaker,
}

impl PendingQueue {
    pub fn new(waker: ReactorWaker) -> Self {
        Self {
            inbox: Mutex::new(Vec::new()),
            waker,
        }
    }

    pub fn push_transfer(&self, transfer: TransferHandle) {
        self.push(PendingItem::Enqueue(transfer));
    }

    pub fn push_cancel(&self, token: CancellationToken) {
        self.push(PendingItem::Cancel(token));
    }

    fn push(&self, item: PendingItem) {
        self.lock().push(item);
        self.waker.wake();
    }

    /// Takes everything pushed so far, oldest first.
    pub fn drain(&self) -> Vec<PendingItem> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingItem>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outbox of finalized transfers waiting for `on_complete` delivery.
#[derive(Debug, Default)]
pub struct CompletedQueue {
    items: Mutex<Vec<TransferHandle>>,
    available: Condvar,
}

impl CompletedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, transfer: TransferHandle) {
        self.lock().push(transfer);
        self.available.notify_all();
    }

    pub fn push_all(&self, transfers: impl IntoIterator<Item = TransferHandle>) {
        let mut items = self.lock();
        let before = items.len();
        items.extend(transfers);
        let added = items.len() > before;
        drop(items);
        if added {
            self.available.notify_all();
        }
    }

    pub fn drain(&self) -> Vec<TransferHandle> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until the queue is non-empty or the timeout elapses. Returns
    /// whether anything is waiting.
    pub fn wait(&self, timeout: Duration) -> bool {
        let items = self.lock();
        let (items, _) = self
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !items.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TransferHandle>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
