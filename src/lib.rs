//! # bvdl
//!
//! This crate provides a library for downloading Bilibili videos at the best
//! quality the account can access. Separate DASH video and audio streams are
//! downloaded and merged with ffmpeg; older single-file streams are saved
//! as-is.
//!
//! ## Usage
//!
//! The `worker` module ties everything together. Pass it a video URL or a raw
//! `BV…`/`av…` id and listen for events while it runs.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bvdl::{api::BiliApi, config::Config, util, worker};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     // HttpClient is a wrapper around reqwest::Client with a cookie store
//!     let client = Arc::new(util::HttpClient::new().unwrap());
//!
//!     let worker = worker::Worker::new(
//!         Config::default(),
//!         Arc::new(BiliApi::new(client.clone())),
//!         client,
//!     );
//!
//!     // Events can be ignored by dropping the receiver
//!     let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//!     let outcome = worker::start(
//!         &worker,
//!         "https://www.bilibili.com/video/BV1xx411c7mD",
//!         1,
//!         &tx,
//!         &CancellationToken::new(),
//!     )
//!     .await;
//!     println!("{:?}", outcome);
//! }
//! ```
//!
//! Cancelling the token stops the job at the next chunk and removes every
//! partial file it created.

#![forbid(unsafe_code)]

#[macro_use]
extern crate log;

pub mod api;
pub mod config;
pub mod download;
pub mod ffmpeg;
pub mod ident;
pub mod manifest;
pub mod metadata;
pub mod select;
pub mod stats;
pub mod util;
pub mod worker;
