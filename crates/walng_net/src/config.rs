use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Upper bound on one wait for I/O readiness. A wake cuts it short.
    pub poll_timeout: Duration,
    pub connect_timeout: Duration,
    /// Redirects followed by transfers using `RedirectPolicy::Follow`.
    pub redirect_limit: usize,
    /// Registrations beyond this many active transfers are rejected.
    pub max_active_transfers: usize,
    pub max_body_bytes: Option<u64>,
    /// Bytes reserved up front for each transfer's output buffer.
    pub buffer_capacity: usize,
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            redirect_limit: 10,
            max_active_transfers: 256,
            max_body_bytes: None,
            buffer_capacity: 16 * 1024,
            thread_name: "walng-fetch".to_string(),
        }
    }
}
