//! Streaming download of a single URL to a local file.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{stats::SpeedSampler, util};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("{0}")]
    Other(String),
}

/// Source of byte streams, usually an HTTP client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Box<dyn StreamHandle>, TransportError>;
}

/// An open read session.
#[async_trait]
pub trait StreamHandle: Send {
    /// Advertised length in bytes, 0 if unknown.
    fn content_length(&self) -> u64;

    /// Next chunk, or `None` at end of stream.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { bytes: u64 },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferEvent {
    /// Sent after every chunk. `total` is 0 while unknown.
    Progress { received: u64, total: u64 },
    /// Sent at most every [`crate::stats::SPEED_SAMPLE_INTERVAL`].
    Speed { bytes_per_sec: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

/// Bookkeeping for one stream download.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination: PathBuf,
    pub total_bytes: u64,
    pub received_bytes: u64,
    pub state: TaskState,
}

impl DownloadTask {
    pub fn new(source_url: &str, destination: PathBuf) -> Self {
        Self {
            source_url: source_url.to_string(),
            destination,
            total_bytes: 0,
            received_bytes: 0,
            state: TaskState::Pending,
        }
    }
}

#[derive(Clone)]
pub struct Downloader {
    transport: Arc<dyn Transport>,
    headers: HeaderMap,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, headers: HeaderMap) -> Self {
        Self { transport, headers }
    }

    /// Run `task`, keeping its counters and state up to date.
    pub async fn run<F>(
        &self,
        task: &mut DownloadTask,
        mut sink: F,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        F: FnMut(TransferEvent) + Send,
    {
        let url = task.source_url.clone();
        let dest = task.destination.clone();
        task.state = TaskState::InProgress;

        let res = self
            .download(
                &url,
                &dest,
                |event| {
                    if let TransferEvent::Progress { received, total } = event {
                        task.received_bytes = received;
                        task.total_bytes = total;
                    }
                    sink(event)
                },
                cancel,
            )
            .await;

        task.state = match res {
            Ok(DownloadOutcome::Completed { .. }) => TaskState::Completed,
            Ok(DownloadOutcome::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        res
    }

    /// Download `url` to `dest`. The partial file is removed unless the
    /// stream was read to its end.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        mut sink: F,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        F: FnMut(TransferEvent) + Send,
    {
        if cancel.is_cancelled() {
            return Ok(DownloadOutcome::Cancelled);
        }

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DownloadOutcome::Cancelled),
            handle = self.transport.open(url, &self.headers) => handle?,
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(dest).await?;
        debug!("Downloading {} to {}", url, dest.display());

        let res = Self::copy_stream(handle, file, &mut sink, cancel).await;
        match res {
            Ok(DownloadOutcome::Completed { bytes }) => {
                debug!("Finished {} ({})", dest.display(), util::format_bytes(bytes));
            }
            Ok(DownloadOutcome::Cancelled) => {
                info!("Download of {} cancelled", dest.display());
                util::remove_if_exists(dest).await;
            }
            Err(ref e) => {
                warn!("Download of {} failed: {}", dest.display(), e);
                util::remove_if_exists(dest).await;
            }
        }

        res
    }

    async fn copy_stream<F>(
        mut handle: Box<dyn StreamHandle>,
        mut file: File,
        sink: &mut F,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        F: FnMut(TransferEvent) + Send,
    {
        let mut total = handle.content_length();
        let mut received = 0u64;
        let mut sampler = SpeedSampler::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(DownloadOutcome::Cancelled),
                chunk = handle.read_chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            // Some servers under-report the length
            if total != 0 && received > total {
                total = received;
            }

            sink(TransferEvent::Progress { received, total });
            if let Some(bytes_per_sec) = sampler.sample(received) {
                sink(TransferEvent::Speed { bytes_per_sec });
            }
        }

        file.flush().await?;

        // The advertised length is only a hint
        if total != 0 && received < total {
            warn!("Stream ended after {} of {} advertised bytes", received, total);
        }

        Ok(DownloadOutcome::Completed { bytes: received })
    }
}
