//! Job coordinator: resolve → fetch manifest → select → download → merge.

use std::{fmt, future::Future, path::PathBuf, sync::Arc};

use futures::try_join;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::Config,
    download::{
        DownloadError, DownloadOutcome, DownloadTask, Downloader, TransferEvent, Transport,
    },
    ffmpeg::{MergeError, Merger},
    ident::{self, ParseError, VideoRef},
    manifest::{Manifest, StreamDescriptor},
    metadata::{MetadataError, MetadataProvider, VideoInfo},
    select::{self, Quality},
    util,
};

const VIDEO_EXT: &str = "m4v";
const AUDIO_EXT: &str = "m4a";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    ResolvingIdentifier,
    FetchingManifest,
    SelectingStreams,
    DownloadingVideo,
    DownloadingAudio,
    Merging,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "Pending",
            JobState::ResolvingIdentifier => "Resolving video id",
            JobState::FetchingManifest => "Fetching video info",
            JobState::SelectingStreams => "Selecting streams",
            JobState::DownloadingVideo => "Downloading video stream",
            JobState::DownloadingAudio => "Downloading audio stream",
            JobState::Merging => "Merging video and audio",
            JobState::Completed => "Completed",
            JobState::Cancelled => "Cancelled",
            JobState::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    State(JobState),
    Status(String),
    Info(VideoInfo),
    Selected {
        video: StreamDescriptor,
        audio: Option<StreamDescriptor>,
    },
    Progress {
        stream: StreamKind,
        received: u64,
        total: u64,
    },
    Speed {
        stream: StreamKind,
        bytes_per_sec: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Metadata,
    PageNotFound,
    StreamNotFound,
    Download,
    MergeToolMissing,
    MergeFailed,
    Io,
    Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("could not parse video id: {0}")]
    Parse(#[from] ParseError),
    #[error("could not fetch video info: {0}")]
    Metadata(#[from] MetadataError),
    #[error("page {page} does not exist, the video has {count} page(s)")]
    PageNotFound { page: u32, count: usize },
    #[error("no usable video stream found")]
    StreamNotFound,
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("ffmpeg not found at {0:?}, install it and add it to PATH")]
    MergeToolMissing(PathBuf),
    #[error("merging video and audio failed: {0}")]
    MergeFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

impl From<MergeError> for JobError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::MergeToolMissing(path) => JobError::MergeToolMissing(path),
            MergeError::MergeFailed(msg) => JobError::MergeFailed(msg),
            MergeError::IoError(e) => JobError::Io(e),
        }
    }
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Parse(_) => ErrorKind::Parse,
            JobError::Metadata(_) => ErrorKind::Metadata,
            JobError::PageNotFound { .. } => ErrorKind::PageNotFound,
            JobError::StreamNotFound => ErrorKind::StreamNotFound,
            JobError::Download(_) => ErrorKind::Download,
            JobError::MergeToolMissing(_) => ErrorKind::MergeToolMissing,
            JobError::MergeFailed(_) => ErrorKind::MergeFailed,
            JobError::Io(_) => ErrorKind::Io,
            JobError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// What a finished job reports to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { path: PathBuf, size: u64 },
    /// Stopped on request; not a failure.
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

/// State of one download invocation.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub input: String,
    /// Used unless the input itself names a page above 1.
    pub requested_page: u32,
    pub requested_quality: Quality,
    pub output_dir: PathBuf,
    pub video_ref: Option<VideoRef>,
    pub video_task: Option<DownloadTask>,
    pub audio_task: Option<DownloadTask>,
    pub final_path: Option<PathBuf>,
    pub state: JobState,
}

impl DownloadJob {
    pub fn new(input: &str, config: &Config) -> Self {
        Self {
            input: input.to_string(),
            requested_page: 1,
            requested_quality: config.quality,
            output_dir: config.output_dir.clone(),
            video_ref: None,
            video_task: None,
            audio_task: None,
            final_path: None,
            state: JobState::Pending,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.requested_page = page;
        self
    }

    fn temp_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.video_task
            .iter()
            .chain(self.audio_task.iter())
            .map(|t| &t.destination)
    }
}

/// Output file name: the title, plus page number and part name for
/// multi-page videos.
pub fn output_file_name(info: &VideoInfo, page: u32, ext: &str) -> String {
    let name = if info.pages.len() > 1 {
        format!("{}_P{}_{}", info.title, page, info.part_name(page))
    } else {
        info.title.clone()
    };
    format!("{}.{}", util::sanitize_filename(&name), ext)
}

fn send(events: &UnboundedSender<JobEvent>, event: JobEvent) {
    // Nobody listening is fine
    let _ = events.send(event);
}

fn forward(events: &UnboundedSender<JobEvent>, stream: StreamKind, event: TransferEvent) {
    let event = match event {
        TransferEvent::Progress { received, total } => JobEvent::Progress {
            stream,
            received,
            total,
        },
        TransferEvent::Speed { bytes_per_sec } => JobEvent::Speed {
            stream,
            bytes_per_sec,
        },
    };
    send(events, event);
}

async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, E>>,
    JobError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        res = fut => res.map_err(JobError::from),
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    Ok(())
}

pub struct Worker {
    config: Config,
    provider: Arc<dyn MetadataProvider>,
    downloader: Downloader,
    merger: Merger,
}

impl Worker {
    pub fn new(
        config: Config,
        provider: Arc<dyn MetadataProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let downloader = Downloader::new(transport, config.request_headers());
        let merger = Merger::new(config.ffmpeg.clone());
        Self {
            config,
            provider,
            downloader,
            merger,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn merger(&self) -> &Merger {
        &self.merger
    }

    /// Drive `job` to a terminal state. Partial files of the job are removed
    /// on every exit path except a failed merge, which keeps its inputs.
    pub async fn run(
        &self,
        job: &mut DownloadJob,
        events: &UnboundedSender<JobEvent>,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        match self.execute(job, events, cancel).await {
            Ok(path) => {
                let size = tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                info!("Saved {} ({})", path.display(), util::format_bytes(size));
                self.enter(job, JobState::Completed, events);
                JobOutcome::Completed { path, size }
            }
            Err(e) => {
                self.cleanup(job, &e).await;
                if let JobError::Cancelled = e {
                    self.enter(job, JobState::Cancelled, events);
                    JobOutcome::Cancelled
                } else {
                    error!("Job for {:?} failed: {}", job.input, e);
                    self.enter(job, JobState::Failed, events);
                    JobOutcome::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
            }
        }
    }

    fn enter(&self, job: &mut DownloadJob, state: JobState, events: &UnboundedSender<JobEvent>) {
        debug!("{:?} -> {:?}", job.state, state);
        job.state = state;
        send(events, JobEvent::State(state));
    }

    async fn execute(
        &self,
        job: &mut DownloadJob,
        events: &UnboundedSender<JobEvent>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        check_cancelled(cancel)?;

        self.enter(job, JobState::ResolvingIdentifier, events);
        let parsed = ident::parse(&job.input)?;
        let page = if parsed.page > 1 {
            parsed.page
        } else {
            job.requested_page
        };
        let video = parsed.with_page(page);
        job.video_ref = Some(video.clone());
        check_cancelled(cancel)?;

        self.enter(job, JobState::FetchingManifest, events);
        let info = cancellable(cancel, self.provider.get_info(&video)).await?;
        info!(
            "{} by {} ({}:{:02}, {} page(s))",
            info.title,
            info.owner,
            info.duration_secs / 60,
            info.duration_secs % 60,
            info.pages.len()
        );
        send(events, JobEvent::Info(info.clone()));

        if page == 0 || page as usize > info.pages.len() {
            return Err(JobError::PageNotFound {
                page,
                count: info.pages.len(),
            });
        }
        send(
            events,
            JobEvent::Status(format!("P{} - {}", page, info.part_name(page))),
        );

        let manifest = cancellable(
            cancel,
            self.provider.get_manifest(&video, page as usize - 1),
        )
        .await?;

        self.enter(job, JobState::SelectingStreams, events);
        let final_path = job.output_dir.join(output_file_name(
            &info,
            page,
            &self.config.container_ext,
        ));
        job.final_path = Some(final_path.clone());

        let (video_url, audio_url) = match &manifest {
            Manifest::Combined { url } => {
                if url.is_empty() {
                    return Err(JobError::StreamNotFound);
                }
                info!("Single combined stream");
                (url.clone(), None)
            }
            Manifest::Dash(dash) => {
                let priorities = &self.config.priorities;
                let video_stream =
                    select::select_video(&dash.video, job.requested_quality, priorities)
                        .ok_or(JobError::StreamNotFound)?;
                let video_url = video_stream.url().ok_or(JobError::StreamNotFound)?;

                let audio_stream = select::select_audio(dash, priorities);
                let audio_url = audio_stream.and_then(|a| a.url());
                if audio_stream.is_some() && audio_url.is_none() {
                    warn!("Selected audio stream has no URL, downloading video only");
                }

                let audio_label = audio_stream
                    .map(|a| select::audio_quality_name(a.quality_id))
                    .unwrap_or_else(|| "none".to_string());
                info!(
                    "Selected video {} ({}), audio {}",
                    select::video_quality_name(video_stream.quality_id),
                    video_stream.codec,
                    audio_label
                );
                send(
                    events,
                    JobEvent::Selected {
                        video: video_stream.clone(),
                        audio: audio_stream.cloned(),
                    },
                );

                (video_url.to_string(), audio_url.map(str::to_string))
            }
        };

        let scratch = &self.config.scratch_dir;
        job.video_task = Some(DownloadTask::new(
            &video_url,
            scratch.join(format!("{}.{}", Uuid::new_v4(), VIDEO_EXT)),
        ));
        job.audio_task = audio_url.as_ref().map(|url| {
            DownloadTask::new(url, scratch.join(format!("{}.{}", Uuid::new_v4(), AUDIO_EXT)))
        });

        if self.config.concurrent_streams && job.audio_task.is_some() {
            self.download_concurrently(job, events, cancel).await?;
        } else {
            self.download_sequentially(job, events, cancel).await?;
        }
        check_cancelled(cancel)?;

        tokio::fs::create_dir_all(&job.output_dir).await?;
        let video_tmp = job
            .video_task
            .as_ref()
            .map(|t| t.destination.clone())
            .ok_or(JobError::StreamNotFound)?;

        match job.audio_task.as_ref().map(|t| t.destination.clone()) {
            Some(audio_tmp) => {
                let available = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    available = self.merger.is_available() => available,
                };
                if !available {
                    return Err(JobError::MergeToolMissing(self.config.ffmpeg.clone()));
                }
                check_cancelled(cancel)?;

                // Merging means ffmpeg is running and may write the output
                let mux = self.merger.start(&video_tmp, &audio_tmp, &final_path)?;
                self.enter(job, JobState::Merging, events);
                cancellable(cancel, mux.finish()).await?;
            }
            None => {
                util::move_file(&video_tmp, &final_path).await?;
            }
        }

        Ok(final_path)
    }

    async fn download_one(
        &self,
        task: &mut DownloadTask,
        stream: StreamKind,
        events: &UnboundedSender<JobEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let outcome = self
            .downloader
            .run(task, |e| forward(events, stream, e), cancel)
            .await?;

        match outcome {
            DownloadOutcome::Completed { bytes } => {
                debug!("{:?} stream done, {}", stream, util::format_bytes(bytes));
                Ok(())
            }
            DownloadOutcome::Cancelled => Err(JobError::Cancelled),
        }
    }

    async fn download_sequentially(
        &self,
        job: &mut DownloadJob,
        events: &UnboundedSender<JobEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        self.enter(job, JobState::DownloadingVideo, events);
        if let Some(task) = job.video_task.as_mut() {
            self.download_one(task, StreamKind::Video, events, cancel)
                .await?;
        }
        check_cancelled(cancel)?;

        if job.audio_task.is_some() {
            self.enter(job, JobState::DownloadingAudio, events);
            if let Some(task) = job.audio_task.as_mut() {
                self.download_one(task, StreamKind::Audio, events, cancel)
                    .await?;
            }
        }

        Ok(())
    }

    /// Both streams at once, so both download states are entered up front.
    /// The first failure drops the other download.
    async fn download_concurrently(
        &self,
        job: &mut DownloadJob,
        events: &UnboundedSender<JobEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        self.enter(job, JobState::DownloadingVideo, events);
        self.enter(job, JobState::DownloadingAudio, events);
        let (Some(video), Some(audio)) = (job.video_task.as_mut(), job.audio_task.as_mut()) else {
            return Ok(());
        };

        try_join!(
            self.download_one(video, StreamKind::Video, events, cancel),
            self.download_one(audio, StreamKind::Audio, events, cancel),
        )?;

        Ok(())
    }

    async fn cleanup(&self, job: &DownloadJob, err: &JobError) {
        // A failed merge keeps its inputs for troubleshooting
        if !matches!(err, JobError::MergeFailed(_)) {
            for path in job.temp_files() {
                util::remove_if_exists(path).await;
            }
        }

        // Only a running ffmpeg can have touched the output
        if job.state == JobState::Merging {
            if let Some(path) = &job.final_path {
                util::remove_if_exists(path).await;
            }
        }
    }
}

/// Run a job for `input` with the worker's configuration.
pub async fn start(
    worker: &Worker,
    input: &str,
    page: u32,
    events: &UnboundedSender<JobEvent>,
    cancel: &CancellationToken,
) -> JobOutcome {
    let mut job = DownloadJob::new(input, worker.config()).with_page(page);
    worker.run(&mut job, events, cancel).await
}
