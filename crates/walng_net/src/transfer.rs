use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderValue;
use thiserror::Error;
use url::Url;

use crate::types::TransferId;
use crate::{CancellationToken, RedirectPolicy, ResponseHandler, ResponseHead, TransferStatus};

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleInitError {
    #[error("could not reserve {capacity} bytes for the transfer buffer: {message}")]
    BufferAllocation { capacity: usize, message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("unsupported url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("user agent is not a valid header value")]
    InvalidUserAgent,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("response body exceeds {limit} bytes ({received} received)")]
pub struct BodyLimitExceeded {
    pub limit: u64,
    pub received: u64,
}

/// A handler callback panicked; only its own transfer is affected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("response handler panicked: {0}")]
pub struct HandlerPanic(pub String);

#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) url: Url,
    pub(crate) user_agent: HeaderValue,
    pub(crate) timeout: Option<Duration>,
    pub(crate) redirect: RedirectPolicy,
}

/// One network transfer: protocol settings, output buffer and the caller's
/// handler.
///
/// Owned by exactly one party at a time: the submitting thread, the pending
/// queue, the reactor, the completed queue, and finally the thread delivering
/// `on_complete`. Only the current owner touches the buffer.
pub struct TransferHandle {
    id: TransferId,
    token: CancellationToken,
    handler: Arc<dyn ResponseHandler>,
    target: Option<Target>,
    buffer: Vec<u8>,
    received: u64,
    max_body_bytes: Option<u64>,
    http_status: Option<u16>,
    started: Option<Instant>,
    status: Option<TransferStatus>,
    diagnostic: String,
}

impl TransferHandle {
    pub fn create(
        token: CancellationToken,
        handler: Arc<dyn ResponseHandler>,
        buffer_capacity: usize,
    ) -> Result<Self, HandleInitError> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve(buffer_capacity)
            .map_err(|err| HandleInitError::BufferAllocation {
                capacity: buffer_capacity,
                message: err.to_string(),
            })?;
        Ok(Self::with_buffer(token, handler, buffer))
    }

    /// A transfer that never got off the ground; it goes straight to delivery.
    pub(crate) fn failed(
        token: CancellationToken,
        handler: Arc<dyn ResponseHandler>,
        status: TransferStatus,
        diagnostic: impl Into<String>,
    ) -> Self {
        let mut transfer = Self::with_buffer(token, handler, Vec::new());
        transfer.finalize(status, diagnostic);
        transfer
    }

    fn with_buffer(
        token: CancellationToken,
        handler: Arc<dyn ResponseHandler>,
        buffer: Vec<u8>,
    ) -> Self {
        Self {
            id: TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed)),
            token,
            handler,
            target: None,
            buffer,
            received: 0,
            max_body_bytes: None,
            http_status: None,
            started: None,
            status: None,
            diagnostic: String::new(),
        }
    }

    pub fn configure(
        &mut self,
        url: &str,
        user_agent: &str,
        timeout: Option<Duration>,
        redirect: RedirectPolicy,
    ) -> Result<(), ConfigurationError> {
        let url = Url::parse(url).map_err(|err| ConfigurationError::InvalidUrl {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigurationError::UnsupportedScheme(url.scheme().to_string()));
        }
        let user_agent =
            HeaderValue::from_str(user_agent).map_err(|_| ConfigurationError::InvalidUserAgent)?;
        if timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigurationError::ZeroTimeout);
        }

        self.target = Some(Target {
            url,
            user_agent,
            timeout,
            redirect,
        });
        Ok(())
    }

    pub fn set_max_body_bytes(&mut self, limit: Option<u64>) {
        self.max_body_bytes = limit;
    }

    /// Appends a chunk received from the engine. Delivery to the handler
    /// happens on the next flush.
    pub fn on_data(&mut self, chunk: &[u8]) -> Result<(), BodyLimitExceeded> {
        let received = self.received + chunk.len() as u64;
        if let Some(limit) = self.max_body_bytes {
            if received > limit {
                return Err(BodyLimitExceeded { limit, received });
            }
        }
        self.received = received;
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.token
    }

    pub fn url(&self) -> Option<&Url> {
        self.target.as_ref().map(|target| &target.url)
    }

    #[cfg(test)]
    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.target
            .as_ref()
            .map(|target| target.redirect)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn max_body_bytes(&self) -> Option<u64> {
        self.max_body_bytes
    }

    /// Final status; `None` while the transfer is still active.
    #[cfg(test)]
    pub fn status(&self) -> Option<TransferStatus> {
        self.status
    }

    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }

    pub(crate) fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = Some(Instant::now());
    }

    pub(crate) fn elapsed(&self) -> Option<Duration> {
        self.started.map(|started| started.elapsed())
    }

    pub(crate) fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub(crate) fn record_head(&mut self, head: &ResponseHead) -> Result<(), HandlerPanic> {
        self.http_status = Some(head.status);
        let handler = &self.handler;
        guarded(|| handler.on_response(head))
    }

    /// Hands buffered bytes to the handler.
    pub(crate) fn flush(&mut self) -> Result<(), HandlerPanic> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = guarded(|| self.handler.on_chunk(&self.buffer));
        self.buffer.clear();
        result
    }

    /// Records the final status. Unflushed bytes are dropped.
    pub(crate) fn finalize(&mut self, status: TransferStatus, diagnostic: impl Into<String>) {
        self.buffer = Vec::new();
        self.status = Some(status);
        self.diagnostic = diagnostic.into();
    }

    /// Invokes `on_complete` and releases the transfer.
    pub(crate) fn deliver(self) -> Result<(), HandlerPanic> {
        let status = self.status.unwrap_or(TransferStatus::Aborted);
        guarded(|| self.handler.on_complete(status, &self.diagnostic))
    }
}

fn guarded(callback: impl FnOnce()) -> Result<(), HandlerPanic> {
    panic::catch_unwind(AssertUnwindSafe(callback))
        .map_err(|payload| HandlerPanic(panic_message(payload.as_ref())))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("url", &self.url().map(Url::as_str))
            .field("received", &self.received)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
