use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Runtime;
use walng_logging::{walng_debug, walng_error, walng_info, walng_trace, walng_warn};

use crate::queue::{CompletedQueue, PendingItem, PendingQueue};
use crate::reactor::{PollOutcome, Reactor, ReactorError, ReactorWaker};
use crate::transfer::TransferHandle;
use crate::{CancellationToken, Request, ResponseHandler, TransferStatus, WorkerConfig};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to build the worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to spawn the worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error("worker thread exited before it was ready")]
    Startup,
}

struct Shared {
    running: AtomicBool,
    pending: PendingQueue,
    completed: CompletedQueue,
}

impl Shared {
    fn new(waker: ReactorWaker) -> Self {
        Self {
            running: AtomicBool::new(true),
            pending: PendingQueue::new(waker),
            completed: CompletedQueue::new(),
        }
    }
}

/// Runs every transfer on one dedicated background thread.
///
/// `enqueue` and `cancel` may be called from any thread and never wait on the
/// network. Results come back only through `poll_completed`, which runs the
/// handlers' `on_complete` on the calling thread. Dropping the worker stops the
/// thread promptly; transfers still in flight are abandoned and their handlers
/// never hear about them.
pub struct FetchWorker {
    shared: Arc<Shared>,
    waker: ReactorWaker,
    buffer_capacity: usize,
    max_body_bytes: Option<u64>,
    thread: Option<JoinHandle<()>>,
}

impl FetchWorker {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let waker = ReactorWaker::new();
        let reactor = Reactor::new(&config, waker.clone())?;
        let shared = Arc::new(Shared::new(waker.clone()));

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let thread = {
            let shared = Arc::clone(&shared);
            let poll_timeout = config.poll_timeout;
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    run(runtime, reactor, &shared, poll_timeout);
                })
                .map_err(WorkerError::Spawn)?
        };

        let startup = match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(WorkerError::Runtime(err)),
            Err(_) => Err(WorkerError::Startup),
        };
        if let Err(err) = startup {
            let _ = thread.join();
            return Err(err);
        }

        walng_info!(
            "Fetch worker started on thread {:?} (poll timeout {:?}, max {} active transfers)",
            config.thread_name,
            config.poll_timeout,
            config.max_active_transfers
        );
        Ok(Self {
            shared,
            waker,
            buffer_capacity: config.buffer_capacity,
            max_body_bytes: config.max_body_bytes,
            thread: Some(thread),
        })
    }

    /// Queues a request. Failures, including a malformed request, are
    /// reported later through `handler.on_complete`.
    pub fn enqueue(
        &self,
        request: &Request,
        token: CancellationToken,
        handler: Arc<dyn ResponseHandler>,
    ) {
        match self.prepare(request, token, handler) {
            Ok(transfer) => {
                walng_trace!("Queued token={} url={}", token, request.url);
                self.shared.pending.push_transfer(transfer);
            }
            Err(failed) => {
                walng_warn!(
                    "Request token={} url={} failed before start: {}",
                    token,
                    request.url,
                    failed.diagnostic()
                );
                self.shared.completed.push(failed);
            }
        }
    }

    fn prepare(
        &self,
        request: &Request,
        token: CancellationToken,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<TransferHandle, TransferHandle> {
        let mut transfer =
            match TransferHandle::create(token, Arc::clone(&handler), self.buffer_capacity) {
                Ok(transfer) => transfer,
                Err(err) => {
                    return Err(TransferHandle::failed(
                        token,
                        handler,
                        TransferStatus::InitFailed,
                        err.to_string(),
                    ))
                }
            };
        if let Err(err) = transfer.configure(
            &request.url,
            &request.user_agent,
            request.timeout,
            request.redirect,
        ) {
            transfer.finalize(TransferStatus::InvalidRequest, err.to_string());
            return Err(transfer);
        }
        transfer.set_max_body_bytes(self.max_body_bytes);
        Ok(transfer)
    }

    /// Asks the worker to cancel every transfer carrying `token`. Unknown or
    /// already completed tokens are ignored.
    pub fn cancel(&self, token: CancellationToken) {
        walng_trace!("Cancel requested for token={}", token);
        self.shared.pending.push_cancel(token);
    }

    /// Delivers `on_complete` for everything finished so far and returns how
    /// many handlers were invoked.
    pub fn poll_completed(&self) -> usize {
        let completed = self.shared.completed.drain();
        let count = completed.len();
        for transfer in completed {
            let token = transfer.token();
            if let Err(err) = transfer.deliver() {
                walng_warn!("Completion handler for token={} failed: {}", token, err);
            }
        }
        count
    }

    /// Blocks until a completion is ready for `poll_completed` or the timeout
    /// elapses.
    pub fn wait_completed(&self, timeout: Duration) -> bool {
        self.shared.completed.wait(timeout)
    }

    /// Whether the worker thread is alive and accepting work.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::Release);
        self.waker.wake();
        if thread.join().is_err() {
            walng_error!("Fetch worker thread panicked");
        }
        let undelivered = self.shared.completed.len();
        if undelivered > 0 {
            walng_debug!("Dropping {} undelivered completions", undelivered);
        }
    }
}

impl Drop for FetchWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(runtime: Runtime, reactor: Reactor, shared: &Shared, poll_timeout: Duration) {
    runtime.block_on(async move {
        let mut reactor = reactor;
        while shared.running.load(Ordering::Acquire) {
            process_pending(&mut reactor, shared);
            process_transfers(&mut reactor);
            shared.completed.push_all(reactor.drain_completed());
            wait_transfer_events(&mut reactor, poll_timeout).await;
        }
        walng_info!(
            "Fetch worker stopping; abandoning {} active transfers",
            reactor.active_count()
        );
    });
}

/// Applies pending work in submission order. A cancel reaches only the
/// transfers enqueued before it: those still staged in this batch never
/// reach the reactor, and active ones are removed from it.
fn process_pending(reactor: &mut Reactor, shared: &Shared) {
    let items = shared.pending.drain();
    if items.is_empty() {
        return;
    }

    let mut staged: Vec<TransferHandle> = Vec::new();
    for item in items {
        match item {
            PendingItem::Enqueue(transfer) => staged.push(transfer),
            PendingItem::Cancel(token) => {
                let (cancelled, kept): (Vec<_>, Vec<_>) = staged
                    .into_iter()
                    .partition(|transfer| transfer.token() == token);
                staged = kept;
                for mut transfer in cancelled {
                    walng_debug!("Token {} cancelled before registration", token);
                    transfer.finalize(TransferStatus::Cancelled, "cancelled");
                    shared.completed.push(transfer);
                }
                for id in reactor.transfers_for(token) {
                    if let Some(mut transfer) = reactor.remove(id) {
                        walng_debug!("Cancelled {} token={}", id, token);
                        transfer.finalize(TransferStatus::Cancelled, "cancelled");
                        shared.completed.push(transfer);
                    }
                }
            }
        }
    }

    for transfer in staged {
        if let Err(err) = reactor.add(transfer) {
            walng_warn!("Transfer rejected: {}", err);
        }
    }
}

fn process_transfers(reactor: &mut Reactor) {
    if let Err(err) = reactor.drive() {
        walng_warn!("I/O pass failed: {}", err);
    }
}

async fn wait_transfer_events(reactor: &mut Reactor, poll_timeout: Duration) {
    match reactor.poll_events(poll_timeout).await {
        PollOutcome::Failed(err) => walng_warn!("Waiting for transfer events failed: {}", err),
        outcome => walng_trace!("Poll returned {:?}", outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BodyCollector, RedirectPolicy};

    fn setup() -> (Reactor, Shared) {
        let waker = ReactorWaker::new();
        let reactor = Reactor::new(&WorkerConfig::default(), waker.clone()).unwrap();
        (reactor, Shared::new(waker))
    }

    fn configured(token: u64) -> (TransferHandle, Arc<BodyCollector>) {
        let collector = Arc::new(BodyCollector::new());
        let handler: Arc<dyn ResponseHandler> = collector.clone();
        let mut transfer = TransferHandle::create(CancellationToken(token), handler, 0).unwrap();
        transfer
            .configure("http://127.0.0.1:9/", "walng/test", None, RedirectPolicy::Follow)
            .unwrap();
        (transfer, collector)
    }

    #[test]
    fn cancel_in_same_batch_prevents_registration() {
        let (mut reactor, shared) = setup();
        let (transfer, collector) = configured(4);
        shared.pending.push_transfer(transfer);
        shared.pending.push_cancel(CancellationToken(4));

        process_pending(&mut reactor, &shared);

        assert_eq!(reactor.active_count(), 0);
        let completed = shared.completed.drain();
        assert_eq!(completed.len(), 1);
        for transfer in completed {
            transfer.deliver().unwrap();
        }
        let collected = collector.take_completed().unwrap();
        assert_eq!(
            collected.outcome,
            Some((TransferStatus::Cancelled, "cancelled".to_string()))
        );
        assert!(collected.body.is_empty());
    }

    #[test]
    fn cancel_submitted_before_enqueue_leaves_new_transfer_alone() {
        let (mut reactor, shared) = setup();
        let (transfer, _) = configured(7);
        shared.pending.push_cancel(CancellationToken(7));
        shared.pending.push_transfer(transfer);

        process_pending(&mut reactor, &shared);

        assert_eq!(reactor.active_count(), 1);
        assert!(shared.completed.is_empty());
    }

    #[test]
    fn cancel_between_enqueues_of_reused_token_hits_only_the_first() {
        let (mut reactor, shared) = setup();
        let (first, first_collector) = configured(8);
        let (second, second_collector) = configured(8);
        shared.pending.push_transfer(first);
        shared.pending.push_cancel(CancellationToken(8));
        shared.pending.push_transfer(second);

        process_pending(&mut reactor, &shared);

        assert_eq!(reactor.active_count(), 1);
        for transfer in shared.completed.drain() {
            transfer.deliver().unwrap();
        }
        assert_eq!(
            first_collector.take_completed().unwrap().outcome,
            Some((TransferStatus::Cancelled, "cancelled".to_string()))
        );
        assert!(second_collector.take_completed().is_none());
    }

    #[test]
    fn cancel_removes_only_matching_active_transfer() {
        let (mut reactor, shared) = setup();
        let (first, _) = configured(1);
        let (second, _) = configured(2);
        shared.pending.push_transfer(first);
        shared.pending.push_transfer(second);
        process_pending(&mut reactor, &shared);
        assert_eq!(reactor.active_count(), 2);

        shared.pending.push_cancel(CancellationToken(1));
        shared.pending.push_cancel(CancellationToken(99));
        shared.pending.push_cancel(CancellationToken(1));
        process_pending(&mut reactor, &shared);

        assert_eq!(reactor.active_count(), 1);
        assert_eq!(reactor.transfers_for(CancellationToken(2)).len(), 1);
        let completed = shared.completed.drain();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].token(), CancellationToken(1));
        assert_eq!(completed[0].status(), Some(TransferStatus::Cancelled));

        // Cancelling again after removal changes nothing.
        shared.pending.push_cancel(CancellationToken(1));
        process_pending(&mut reactor, &shared);
        assert!(shared.completed.is_empty());
        assert_eq!(reactor.active_count(), 1);
    }
}
