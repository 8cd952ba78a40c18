use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::FutureExt;
use futures_util::stream::{self, AbortHandle, BoxStream, SelectAll, Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Notify;
use walng_logging::{walng_debug, walng_error, walng_trace, walng_warn};

use crate::transfer::{panic_message, HandlerPanic, TransferHandle};
use crate::types::{classify_reqwest_error, TransferId};
use crate::{
    CancellationToken, RedirectPolicy, ResponseHead, TransferStatus, TransportErrorKind,
    WorkerConfig,
};

/// Events handled per `drive` pass, so a fast body cannot starve the
/// pending queues.
const MAX_EVENTS_PER_DRIVE: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReactorError {
    #[error("failed to initialize the multiplexing engine: {0}")]
    Init(String),
    #[error("multiplexing engine failed: {0}")]
    Multiplex(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("reactor is at capacity ({limit} active transfers)")]
    CapacityExceeded { limit: usize },
    #[error("transfer has no target configured")]
    Unconfigured,
    #[error("engine refused the request: {0}")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// At least one transfer made progress.
    Ready,
    Woken,
    TimedOut,
    Failed(ReactorError),
}

/// Cloneable handle that interrupts `Reactor::poll_events` from any thread.
///
/// A wake issued while nobody is waiting is remembered, so the next wait
/// returns immediately.
#[derive(Debug, Clone, Default)]
pub struct ReactorWaker {
    notify: Arc<Notify>,
}

impl ReactorWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

enum TransferEvent {
    Head(ResponseHead),
    Chunk(Bytes),
    Done(Result<(), reqwest::Error>),
}

enum Phase {
    Connect(Client, reqwest::Request),
    Body(BoxStream<'static, reqwest::Result<Bytes>>),
    Finished,
}

/// Turns one request into head, chunk and done events.
fn transfer_events(
    client: Client,
    request: reqwest::Request,
) -> impl Stream<Item = TransferEvent> + Send + 'static {
    stream::unfold(Phase::Connect(client, request), |phase| async move {
        match phase {
            Phase::Connect(client, request) => match client.execute(request).await {
                Ok(response) => {
                    let head = response_head(&response);
                    let body = response.bytes_stream().boxed();
                    Some((TransferEvent::Head(head), Phase::Body(body)))
                }
                Err(err) => Some((TransferEvent::Done(Err(err)), Phase::Finished)),
            },
            Phase::Body(mut body) => match body.next().await {
                Some(Ok(chunk)) => Some((TransferEvent::Chunk(chunk), Phase::Body(body))),
                Some(Err(err)) => Some((TransferEvent::Done(Err(err)), Phase::Finished)),
                None => Some((TransferEvent::Done(Ok(())), Phase::Finished)),
            },
            Phase::Finished => None,
        }
    })
}

fn response_head(response: &reqwest::Response) -> ResponseHead {
    ResponseHead {
        status: response.status().as_u16(),
        effective_url: response.url().clone(),
        content_type: response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string()),
        content_length: response.content_length(),
    }
}

struct Clients {
    follow: Client,
    refuse: Client,
}

impl Clients {
    fn build(config: &WorkerConfig) -> Result<Self, ReactorError> {
        let build = |policy: Policy| {
            Client::builder()
                .connect_timeout(config.connect_timeout)
                .redirect(policy)
                .build()
                .map_err(|err| ReactorError::Init(err.to_string()))
        };
        Ok(Self {
            follow: build(Policy::limited(config.redirect_limit))?,
            refuse: build(Policy::none())?,
        })
    }

    fn for_policy(&self, policy: RedirectPolicy) -> &Client {
        match policy {
            RedirectPolicy::Follow => &self.follow,
            RedirectPolicy::Refuse => &self.refuse,
        }
    }
}

struct Active {
    transfer: TransferHandle,
    abort: AbortHandle,
}

/// Multiplexes every registered transfer on the current thread.
///
/// All methods must be called from inside the worker's tokio runtime; the
/// reactor itself never spawns tasks, it polls the transfers directly.
pub struct Reactor {
    clients: Clients,
    max_active: usize,
    waker: ReactorWaker,
    active: HashMap<TransferId, Active>,
    streams: SelectAll<BoxStream<'static, (TransferId, TransferEvent)>>,
    completed: Vec<TransferHandle>,
}

impl Reactor {
    pub fn new(config: &WorkerConfig, waker: ReactorWaker) -> Result<Self, ReactorError> {
        Ok(Self {
            clients: Clients::build(config)?,
            max_active: config.max_active_transfers,
            waker,
            active: HashMap::new(),
            streams: SelectAll::new(),
            completed: Vec::new(),
        })
    }

    #[cfg(test)]
    pub fn waker(&self) -> ReactorWaker {
        self.waker.clone()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Registers a transfer. A rejected transfer is finalized as
    /// `TransferStatus::Rejected` and reported by the next `drain_completed`.
    pub fn add(&mut self, mut transfer: TransferHandle) -> Result<TransferId, RegistrationError> {
        let id = transfer.id();
        match self.open(&transfer) {
            Ok(events) => {
                let (events, abort) = stream::abortable(events);
                self.streams.push(events.map(move |event| (id, event)).boxed());
                transfer.mark_started();
                walng_debug!(
                    "Registered {} token={} url={}",
                    id,
                    transfer.token(),
                    transfer.url().map(|url| url.as_str()).unwrap_or_default()
                );
                self.active.insert(id, Active { transfer, abort });
                Ok(id)
            }
            Err(err) => {
                transfer.finalize(TransferStatus::Rejected, err.to_string());
                self.completed.push(transfer);
                Err(err)
            }
        }
    }

    fn open(
        &self,
        transfer: &TransferHandle,
    ) -> Result<impl Stream<Item = TransferEvent> + Send + 'static, RegistrationError> {
        if self.active.len() >= self.max_active {
            return Err(RegistrationError::CapacityExceeded {
                limit: self.max_active,
            });
        }
        let target = transfer.target().ok_or(RegistrationError::Unconfigured)?;
        let client = self.clients.for_policy(target.redirect);

        let mut builder = client
            .get(target.url.clone())
            .header(USER_AGENT, target.user_agent.clone());
        if let Some(timeout) = target.timeout {
            builder = builder.timeout(timeout);
        }
        let request = builder
            .build()
            .map_err(|err| RegistrationError::Request(err.to_string()))?;
        Ok(transfer_events(client.clone(), request))
    }

    /// Deregisters a transfer and stops its I/O. Unknown ids are ignored.
    pub fn remove(&mut self, id: TransferId) -> Option<TransferHandle> {
        let active = self.active.remove(&id)?;
        active.abort.abort();
        Some(active.transfer)
    }

    pub fn transfers_for(&self, token: CancellationToken) -> Vec<TransferId> {
        self.active
            .iter()
            .filter(|(_, active)| active.transfer.token() == token)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Runs one non-blocking I/O pass and returns the number of transfers
    /// still active.
    pub fn drive(&mut self) -> Result<usize, ReactorError> {
        for _ in 0..MAX_EVENTS_PER_DRIVE {
            let polled =
                panic::catch_unwind(AssertUnwindSafe(|| self.streams.next().now_or_never()));
            match polled {
                Ok(Some(Some((id, event)))) => self.apply(id, event),
                Ok(Some(None)) | Ok(None) => break,
                Err(payload) => return Err(self.fail_multiplex(payload)),
            }
        }
        let failed: Vec<(TransferId, HandlerPanic)> = self
            .active
            .iter_mut()
            .filter_map(|(id, active)| active.transfer.flush().err().map(|err| (*id, err)))
            .collect();
        for (id, err) in failed {
            self.abort_transfer(id, err);
        }
        Ok(self.active.len())
    }

    /// Waits until a transfer makes progress, the timeout elapses or the
    /// waker fires.
    pub async fn poll_events(&mut self, timeout: Duration) -> PollOutcome {
        let notify = Arc::clone(&self.waker.notify);
        let has_streams = !self.streams.is_empty();

        tokio::select! {
            biased;
            _ = notify.notified() => PollOutcome::Woken,
            polled = AssertUnwindSafe(self.streams.next()).catch_unwind(), if has_streams => {
                match polled {
                    Ok(Some((id, event))) => {
                        self.apply(id, event);
                        PollOutcome::Ready
                    }
                    Ok(None) => PollOutcome::Ready,
                    Err(payload) => PollOutcome::Failed(self.fail_multiplex(payload)),
                }
            }
            _ = tokio::time::sleep(timeout) => PollOutcome::TimedOut,
        }
    }

    /// Transfers finished since the last call, in the order the engine
    /// reported them.
    pub fn drain_completed(&mut self) -> impl Iterator<Item = TransferHandle> + '_ {
        self.completed.drain(..)
    }

    /// Finalizes every active transfer as `Aborted` and resets the engine.
    pub fn abort_all(&mut self, reason: &str) {
        self.streams = SelectAll::new();
        for (_, active) in self.active.drain() {
            active.abort.abort();
            let mut transfer = active.transfer;
            transfer.finalize(TransferStatus::Aborted, reason);
            self.completed.push(transfer);
        }
    }

    fn fail_multiplex(&mut self, payload: Box<dyn Any + Send>) -> ReactorError {
        let reason = panic_message(payload.as_ref());
        walng_error!(
            "Multiplexing engine failed ({}); aborting {} transfers",
            reason,
            self.active.len()
        );
        self.abort_all(&reason);
        ReactorError::Multiplex(reason)
    }

    fn apply(&mut self, id: TransferId, event: TransferEvent) {
        let Some(active) = self.active.get_mut(&id) else {
            walng_trace!("Dropping event for released {}", id);
            return;
        };
        match event {
            TransferEvent::Head(head) => {
                if let (Some(limit), Some(length)) =
                    (active.transfer.max_body_bytes(), head.content_length)
                {
                    if length > limit {
                        self.finish(
                            id,
                            TransferStatus::Transport(TransportErrorKind::BodyTooLarge),
                            format!("content length {length} exceeds limit of {limit} bytes"),
                        );
                        return;
                    }
                }
                walng_trace!("{} responded {} from {}", id, head.status, head.effective_url);
                if let Err(err) = active.transfer.record_head(&head) {
                    self.abort_transfer(id, err);
                }
            }
            TransferEvent::Chunk(chunk) => {
                walng_trace!("{} received {} bytes", id, chunk.len());
                if let Err(err) = active.transfer.on_data(&chunk) {
                    self.finish(
                        id,
                        TransferStatus::Transport(TransportErrorKind::BodyTooLarge),
                        err.to_string(),
                    );
                }
            }
            TransferEvent::Done(Ok(())) => {
                let status = active
                    .transfer
                    .http_status()
                    .map_or(TransferStatus::Aborted, TransferStatus::Http);
                self.finish(id, status, String::new());
            }
            TransferEvent::Done(Err(err)) => {
                let kind = classify_reqwest_error(&err);
                self.finish(id, TransferStatus::Transport(kind), err.to_string());
            }
        }
    }

    fn finish(&mut self, id: TransferId, status: TransferStatus, diagnostic: String) {
        let Some(mut transfer) = self.remove(id) else {
            return;
        };
        let (status, diagnostic) = match transfer.flush() {
            Ok(()) => (status, diagnostic),
            Err(err) => {
                walng_warn!("{} handler failed on its final chunk: {}", id, err);
                (TransferStatus::Aborted, err.to_string())
            }
        };
        walng_debug!(
            "{} finished with {} after {:?}",
            id,
            status,
            transfer.elapsed().unwrap_or_default()
        );
        transfer.finalize(status, diagnostic);
        self.completed.push(transfer);
    }

    /// Ends one transfer whose handler panicked, leaving the rest running.
    fn abort_transfer(&mut self, id: TransferId, err: HandlerPanic) {
        let Some(mut transfer) = self.remove(id) else {
            return;
        };
        walng_warn!("Aborting {} token={}: {}", id, transfer.token(), err);
        transfer.finalize(TransferStatus::Aborted, err.to_string());
        self.completed.push(transfer);
    }

    #[cfg(test)]
    fn inject_failure(&mut self) {
        let failing = stream::poll_fn(
            |_| -> std::task::Poll<Option<(TransferId, TransferEvent)>> {
                panic!("engine bookkeeping corrupted")
            },
        );
        self.streams.push(failing.boxed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BodyCollector, ResponseHandler};
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reactor(config: &WorkerConfig) -> Reactor {
        Reactor::new(config, ReactorWaker::new()).unwrap()
    }

    fn configured_transfer(url: &str, token: u64) -> (TransferHandle, Arc<BodyCollector>) {
        let collector = Arc::new(BodyCollector::new());
        let handler: Arc<dyn ResponseHandler> = collector.clone();
        let mut transfer = TransferHandle::create(CancellationToken(token), handler, 16).unwrap();
        transfer
            .configure(url, "walng/test", None, RedirectPolicy::Follow)
            .unwrap();
        (transfer, collector)
    }

    async fn run_until_idle(reactor: &mut Reactor, budget: Duration) -> Vec<TransferHandle> {
        let deadline = Instant::now() + budget;
        let mut done = Vec::new();
        while Instant::now() < deadline {
            let active = reactor.drive().unwrap();
            done.extend(reactor.drain_completed());
            if active == 0 {
                break;
            }
            reactor.poll_events(Duration::from_millis(100)).await;
        }
        done
    }

    #[test]
    fn rejects_registration_beyond_capacity() {
        let config = WorkerConfig {
            max_active_transfers: 1,
            ..WorkerConfig::default()
        };
        let mut reactor = reactor(&config);
        let (first, _) = configured_transfer("http://127.0.0.1:9/a", 1);
        let (second, _) = configured_transfer("http://127.0.0.1:9/b", 2);

        assert!(reactor.add(first).is_ok());
        let err = reactor.add(second).unwrap_err();
        assert_eq!(err, RegistrationError::CapacityExceeded { limit: 1 });

        let rejected: Vec<_> = reactor.drain_completed().collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].token(), CancellationToken(2));
        assert_eq!(rejected[0].status(), Some(TransferStatus::Rejected));
        assert_eq!(reactor.active_count(), 1);
    }

    #[test]
    fn rejects_unconfigured_transfer() {
        let mut reactor = reactor(&WorkerConfig::default());
        let handler: Arc<dyn ResponseHandler> = Arc::new(BodyCollector::new());
        let bare = TransferHandle::create(CancellationToken(3), handler, 0).unwrap();

        assert_eq!(reactor.add(bare), Err(RegistrationError::Unconfigured));
        assert_eq!(reactor.drain_completed().count(), 1);
        assert_eq!(reactor.drain_completed().count(), 0);
    }

    #[test]
    fn remove_is_idempotent_and_token_lookup_tracks_it() {
        let mut reactor = reactor(&WorkerConfig::default());
        let (transfer, _) = configured_transfer("http://127.0.0.1:9/", 5);
        let id = reactor.add(transfer).unwrap();

        assert_eq!(reactor.transfers_for(CancellationToken(5)), vec![id]);
        assert!(reactor.transfers_for(CancellationToken(6)).is_empty());

        let removed = reactor.remove(id).unwrap();
        assert_eq!(removed.status(), None);
        assert!(reactor.remove(id).is_none());
        assert!(reactor.transfers_for(CancellationToken(5)).is_empty());
        assert_eq!(reactor.active_count(), 0);
    }

    #[test]
    fn abort_all_finalizes_every_active_transfer() {
        let mut reactor = reactor(&WorkerConfig::default());
        for token in 0..3 {
            let (transfer, _) = configured_transfer("http://127.0.0.1:9/", token);
            reactor.add(transfer).unwrap();
        }

        reactor.abort_all("engine reset");

        let aborted: Vec<_> = reactor.drain_completed().collect();
        assert_eq!(aborted.len(), 3);
        assert!(aborted
            .iter()
            .all(|t| t.status() == Some(TransferStatus::Aborted) && t.diagnostic() == "engine reset"));
        assert_eq!(reactor.active_count(), 0);
    }

    #[tokio::test]
    async fn wake_interrupts_poll_and_timeout_bounds_it() {
        let mut reactor = reactor(&WorkerConfig::default());

        reactor.waker().wake();
        let started = Instant::now();
        assert_eq!(
            reactor.poll_events(Duration::from_secs(10)).await,
            PollOutcome::Woken
        );
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(
            reactor.poll_events(Duration::from_millis(20)).await,
            PollOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn drives_transfer_to_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/palette.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("base00: '#000000'"))
            .mount(&server)
            .await;

        let mut reactor = reactor(&WorkerConfig::default());
        let (transfer, collector) = configured_transfer(&format!("{}/palette.yaml", server.uri()), 9);
        reactor.add(transfer).unwrap();

        let done = run_until_idle(&mut reactor, Duration::from_secs(5)).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status(), Some(TransferStatus::Http(200)));

        // on_complete is delivered by the worker, not the reactor.
        assert!(collector.take_completed().is_none());
        for transfer in done {
            transfer.deliver().unwrap();
        }
        let collected = collector.take_completed().unwrap();
        assert_eq!(collected.body, b"base00: '#000000'");
        assert_eq!(collected.head.map(|head| head.status), Some(200));
    }

    #[tokio::test]
    async fn engine_failure_aborts_all_transfers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut reactor = reactor(&WorkerConfig::default());
        for token in 0..2 {
            let (transfer, _) = configured_transfer(&format!("{}/slow", server.uri()), token);
            reactor.add(transfer).unwrap();
        }
        reactor.inject_failure();

        let err = reactor.drive().unwrap_err();
        assert_eq!(
            err,
            ReactorError::Multiplex("engine bookkeeping corrupted".to_string())
        );
        let aborted: Vec<_> = reactor.drain_completed().collect();
        assert_eq!(aborted.len(), 2);
        assert!(aborted
            .iter()
            .all(|t| t.status() == Some(TransferStatus::Aborted)));

        // The reactor keeps working after the failure.
        assert_eq!(reactor.drive(), Ok(0));
    }

    struct PanicsOnChunk;

    impl ResponseHandler for PanicsOnChunk {
        fn on_chunk(&self, _chunk: &[u8]) {
            panic!("palette parser blew up");
        }

        fn on_complete(&self, _status: TransferStatus, _diagnostic: &str) {}
    }

    #[tokio::test]
    async fn handler_panic_aborts_only_its_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("base00: '#000000'"))
            .mount(&server)
            .await;

        let mut reactor = reactor(&WorkerConfig::default());
        let mut broken =
            TransferHandle::create(CancellationToken(1), Arc::new(PanicsOnChunk), 16).unwrap();
        broken
            .configure(
                &format!("{}/broken.yaml", server.uri()),
                "walng/test",
                None,
                RedirectPolicy::Follow,
            )
            .unwrap();
        let broken_id = reactor.add(broken).unwrap();
        let (healthy, _) = configured_transfer(&format!("{}/healthy.yaml", server.uri()), 2);
        let healthy_id = reactor.add(healthy).unwrap();

        let done = run_until_idle(&mut reactor, Duration::from_secs(5)).await;
        assert_eq!(done.len(), 2);
        let broken = done.iter().find(|t| t.id() == broken_id).unwrap();
        assert_eq!(broken.status(), Some(TransferStatus::Aborted));
        assert!(broken.diagnostic().contains("palette parser blew up"));
        let healthy = done.iter().find(|t| t.id() == healthy_id).unwrap();
        assert_eq!(healthy.status(), Some(TransferStatus::Http(200)));
    }
}
