//! walng network layer: a background fetch worker multiplexing HTTP transfers.
mod config;
mod download;
mod filename;
mod handler;
mod queue;
mod reactor;
mod transfer;
mod types;
mod worker;

pub use config::WorkerConfig;
pub use download::{download, download_with, Download, DownloadError, SaveError};
pub use filename::filename_from_url;
pub use handler::{BodyCollector, Collected, ResponseHandler};
pub use reactor::ReactorError;
pub use types::{
    CancellationToken, RedirectPolicy, Request, ResponseHead, TransferStatus, TransportErrorKind,
    DEFAULT_USER_AGENT,
};
pub use worker::{FetchWorker, WorkerError};
