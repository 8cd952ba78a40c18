use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use thiserror::Error;
use url::Url;

use crate::{
    filename_from_url, BodyCollector, CancellationToken, FetchWorker, Request, TransferStatus,
    WorkerConfig, WorkerError,
};

const COMPLETION_WAIT: Duration = Duration::from_millis(100);

/// A finished download. Any HTTP status counts as finished; check `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub status: u16,
    pub body: Vec<u8>,
    pub effective_url: Url,
    pub content_type: Option<String>,
    pub filename: String,
    pub elapsed: Duration,
}

impl Download {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Writes the body to `{dir}/{filename}`, creating `dir` if needed.
    ///
    /// The body is staged in a temporary file in `dir` and renamed over the
    /// target, so readers never observe a partial file.
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf, SaveError> {
        fs::create_dir_all(dir).map_err(|source| SaveError::OutputDir {
            dir: dir.to_path_buf(),
            source,
        })?;
        let target = dir.join(&self.filename);

        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&self.body)?;
        staged.as_file().sync_all()?;
        staged.persist(&target).map_err(|err| err.error)?;
        Ok(target)
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("cannot use {} as output directory: {source}", .dir.display())]
    OutputDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write download: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("fetch worker stopped before the download finished")]
    WorkerStopped,
    #[error("download failed ({status}): {message}")]
    Failed {
        status: TransferStatus,
        message: String,
    },
}

/// Fetches one url on a private worker and waits for the result.
pub fn download(url: &str, timeout: Option<Duration>) -> Result<Download, DownloadError> {
    let worker = FetchWorker::new(WorkerConfig::default())?;
    let request = Request {
        timeout,
        ..Request::new(url)
    };
    download_with(&worker, &request, CancellationToken(0))
}

/// Fetches one url on a shared worker and waits for the result.
///
/// This thread polls the worker while waiting, so it also delivers any other
/// completions that become ready in the meantime.
pub fn download_with(
    worker: &FetchWorker,
    request: &Request,
    token: CancellationToken,
) -> Result<Download, DownloadError> {
    let started = Instant::now();
    let collector = Arc::new(BodyCollector::new());
    worker.enqueue(request, token, collector.clone());

    let collected = loop {
        worker.wait_completed(COMPLETION_WAIT);
        worker.poll_completed();
        if let Some(collected) = collector.take_completed() {
            break collected;
        }
        if !worker.is_running() {
            return Err(DownloadError::WorkerStopped);
        }
    };

    let (status, message) = collected
        .outcome
        .unwrap_or((TransferStatus::Aborted, String::new()));
    match (status, collected.head) {
        (TransferStatus::Http(code), Some(head)) => Ok(Download {
            status: code,
            body: collected.body,
            filename: filename_from_url(&head.effective_url),
            effective_url: head.effective_url,
            content_type: head.content_type,
            elapsed: started.elapsed(),
        }),
        (status, _) => Err(DownloadError::Failed { status, message }),
    }
}
