use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{ident::VideoRef, manifest::Manifest};

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("request failed: {0}")]
    Http(#[from] crate::util::HttpError),
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("missing data in API response: {0}")]
    MissingData(&'static str),
    #[error("page index {0} out of range")]
    PageOutOfRange(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub part: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub title: String,
    pub owner: String,
    pub duration_secs: u64,
    pub published: Option<DateTime<Utc>>,
    pub pages: Vec<PageInfo>,
}

impl VideoInfo {
    /// Part name of a 1-based page, defaulting to `P{page}` when the page is
    /// unnamed.
    pub fn part_name(&self, page: u32) -> String {
        self.pages
            .get((page as usize).wrapping_sub(1))
            .map(|p| p.part.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("P{}", page))
    }
}

/// Remote source of video metadata and stream manifests.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn get_info(&self, video: &VideoRef) -> Result<VideoInfo, MetadataError>;

    /// Streams of the page at 0-based `page_index`.
    async fn get_manifest(
        &self,
        video: &VideoRef,
        page_index: usize,
    ) -> Result<Manifest, MetadataError>;
}
