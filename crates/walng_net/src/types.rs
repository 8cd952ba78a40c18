use std::fmt;
use std::time::Duration;

use url::Url;

/// User agent sent when the caller does not pick one.
pub const DEFAULT_USER_AGENT: &str = concat!("walng/", env!("CARGO_PKG_VERSION"));

/// Caller-minted id used to cancel a transfer after it was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CancellationToken(pub u64);

impl fmt::Display for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process-unique id of one transfer, independent of its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub(crate) u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedirectPolicy {
    #[default]
    Follow,
    Refuse,
}

/// What to fetch. Immutable once handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub redirect: RedirectPolicy,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: None,
            redirect: RedirectPolicy::Follow,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }
}

/// Response metadata, available once the engine has received the headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub effective_url: Url,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Final outcome of a transfer, handed to `ResponseHandler::on_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The exchange finished; HTTP status as reported by the server.
    Http(u16),
    Transport(TransportErrorKind),
    /// The transfer context could not be allocated.
    InitFailed,
    /// The request could not be configured (bad url, user agent, timeout).
    InvalidRequest,
    /// The reactor refused to register the transfer.
    Rejected,
    Cancelled,
    /// Dropped because the multiplexing engine failed.
    Aborted,
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Http(code) if (200..300).contains(code))
    }

    /// HTTP status code, if the exchange got that far.
    pub fn http_code(&self) -> Option<u16> {
        match self {
            TransferStatus::Http(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Http(code) => write!(f, "http status {code}"),
            TransferStatus::Transport(kind) => write!(f, "transport error: {kind}"),
            TransferStatus::InitFailed => write!(f, "transfer initialization failed"),
            TransferStatus::InvalidRequest => write!(f, "invalid request"),
            TransferStatus::Rejected => write!(f, "rejected by reactor"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Redirect,
    Body,
    Decode,
    BodyTooLarge,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Connect => write!(f, "connection failed"),
            TransportErrorKind::Redirect => write!(f, "redirect limit exceeded"),
            TransportErrorKind::Body => write!(f, "body read failed"),
            TransportErrorKind::Decode => write!(f, "body decode failed"),
            TransportErrorKind::BodyTooLarge => write!(f, "response too large"),
            TransportErrorKind::Other => write!(f, "network error"),
        }
    }
}

pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if err.is_redirect() {
        return TransportErrorKind::Redirect;
    }
    if err.is_connect() {
        return TransportErrorKind::Connect;
    }
    if err.is_decode() {
        return TransportErrorKind::Decode;
    }
    if err.is_body() {
        return TransportErrorKind::Body;
    }
    TransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_2xx_http_is_success() {
        assert!(TransferStatus::Http(200).is_success());
        assert!(TransferStatus::Http(204).is_success());
        assert!(!TransferStatus::Http(301).is_success());
        assert!(!TransferStatus::Http(404).is_success());
        assert!(!TransferStatus::Cancelled.is_success());
        assert!(!TransferStatus::Transport(TransportErrorKind::Timeout).is_success());
    }

    #[test]
    fn request_defaults_follow_redirects_with_crate_user_agent() {
        let request = Request::new("https://example.com/theme.yaml");
        assert_eq!(request.redirect, RedirectPolicy::Follow);
        assert!(request.user_agent.starts_with("walng/"));
        assert_eq!(request.timeout, None);

        let request = request
            .with_timeout(Duration::from_secs(1))
            .with_redirect(RedirectPolicy::Refuse)
            .with_user_agent("custom");
        assert_eq!(request.timeout, Some(Duration::from_secs(1)));
        assert_eq!(request.redirect, RedirectPolicy::Refuse);
        assert_eq!(request.user_agent, "custom");
    }
}
