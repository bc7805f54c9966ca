use std::{process::ExitCode, sync::Arc};

use bvdl::{
    api::BiliApi,
    config::Config,
    select::{self, Quality},
    stats::TransferStats,
    util,
    worker::{self, JobEvent, JobOutcome, StreamKind, Worker},
};
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

const USAGE: &str = "Usage: bvdl <url-or-id> [page] [quality] [output-dir]";

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // Read arguments
    let mut args = std::env::args().skip(1);
    let Some(input) = args.next() else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };
    let page = match args.next().map(|p| p.parse::<u32>()) {
        None => 1,
        Some(Ok(page)) if page >= 1 => page,
        Some(_) => {
            eprintln!("Page must be a positive number\n{}", USAGE);
            return ExitCode::from(2);
        }
    };

    let mut config = Config::from_env();
    if let Some(name) = args.next() {
        match Quality::from_name(&name) {
            Some(quality) => config.quality = quality,
            None => {
                eprintln!("Unknown quality {:?}", name);
                return ExitCode::from(2);
            }
        }
    }
    if let Some(dir) = args.next() {
        config.output_dir = dir.into();
    }

    // Create HttpClient, logged in when a session cookie is provided
    let credential = std::env::var("BVDL_SESSDATA")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|sessdata| util::Credential {
            sessdata,
            ..Default::default()
        });
    let client = match &credential {
        Some(credential) => util::HttpClient::with_credential(credential),
        None => util::HttpClient::new(),
    };
    let client = match client {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Could not create HttpClient: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let api = Arc::new(BiliApi::new(client.clone()));
    let worker = Arc::new(Worker::new(config, api, client));

    if !worker.merger().is_available().await {
        eprintln!(
            "ffmpeg not found at {:?}, install it and add it to PATH or set BVDL_FFMPEG",
            worker.config().ffmpeg
        );
        return ExitCode::FAILURE;
    }

    // Cancel on Ctrl-C
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let job = tokio::spawn({
        let worker = worker.clone();
        let cancel = cancel.clone();
        async move { worker::start(&worker, &input, page, &tx, &cancel).await }
    });

    let mut events = UnboundedReceiverStream::new(rx);
    let mut video = TransferStats::new("Video");
    let mut audio = TransferStats::new("Audio");
    while let Some(event) = events.next().await {
        match event {
            JobEvent::State(state) => {
                if !state.is_terminal() {
                    println!("\x1b[2K\r{}", state);
                }
            }
            JobEvent::Status(status) => println!("{}", status),
            JobEvent::Info(info) => println!("{} by {}", info.title, info.owner),
            JobEvent::Selected { video: v, audio: a } => println!(
                "Video: {} ({}), audio: {}",
                select::video_quality_name(v.quality_id),
                v.codec,
                a.map(|a| select::audio_quality_name(a.quality_id))
                    .unwrap_or_else(|| "none".to_string())
            ),
            JobEvent::Progress {
                stream,
                received,
                total,
            } => {
                let stats = match stream {
                    StreamKind::Video => &mut video,
                    StreamKind::Audio => &mut audio,
                };
                stats.received = received;
                stats.total = total;
                if received == total {
                    stats.print();
                }
            }
            JobEvent::Speed {
                stream,
                bytes_per_sec,
            } => {
                let stats = match stream {
                    StreamKind::Video => &mut video,
                    StreamKind::Audio => &mut audio,
                };
                stats.bytes_per_sec = bytes_per_sec;
                stats.print();
            }
        }
    }
    println!();

    let outcome = match job.await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Worker exited with error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        JobOutcome::Completed { path, size } => {
            println!("Saved {} ({})", path.display(), util::format_bytes(size));
            ExitCode::SUCCESS
        }
        JobOutcome::Cancelled => {
            println!("Cancelled");
            ExitCode::from(130)
        }
        JobOutcome::Failed { message, .. } => {
            eprintln!("Error: {}", message);
            ExitCode::FAILURE
        }
    }
}
