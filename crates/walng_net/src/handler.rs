use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{ResponseHead, TransferStatus};

/// Receives the result of one transfer.
///
/// `on_response` and `on_chunk` run on the worker thread while the transfer is
/// active. `on_complete` runs exactly once, on whichever thread calls
/// `FetchWorker::poll_completed`, after every chunk has been delivered. Nothing
/// is delivered for a transfer after its cancellation has been accepted except
/// the final `on_complete(TransferStatus::Cancelled, ..)`.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, _head: &ResponseHead) {}

    fn on_chunk(&self, chunk: &[u8]);

    fn on_complete(&self, status: TransferStatus, diagnostic: &str);
}

/// Handler that keeps everything it is given.
#[derive(Debug, Default)]
pub struct BodyCollector {
    state: Mutex<Collected>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Collected {
    pub head: Option<ResponseHead>,
    pub body: Vec<u8>,
    pub outcome: Option<(TransferStatus, String)>,
}

impl BodyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Takes the collected data once the transfer has completed.
    pub fn take_completed(&self) -> Option<Collected> {
        let mut state = self.lock();
        if state.outcome.is_none() {
            return None;
        }
        Some(std::mem::take(&mut *state))
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResponseHandler for BodyCollector {
    fn on_response(&self, head: &ResponseHead) {
        self.lock().head = Some(head.clone());
    }

    fn on_chunk(&self, chunk: &[u8]) {
        self.lock().body.extend_from_slice(chunk);
    }

    fn on_complete(&self, status: TransferStatus, diagnostic: &str) {
        self.lock().outcome = Some((status, diagnostic.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_only_yields_after_completion() {
        let collector = BodyCollector::new();
        collector.on_chunk(b"hel");
        collector.on_chunk(b"lo");
        assert!(!collector.is_complete());
        assert!(collector.take_completed().is_none());

        collector.on_complete(TransferStatus::Http(200), "");
        let collected = collector.take_completed().unwrap();
        assert_eq!(collected.body, b"hello");
        assert_eq!(collected.outcome, Some((TransferStatus::Http(200), String::new())));
        assert!(!collector.is_complete());
    }
}
