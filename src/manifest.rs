/// One selectable elementary stream (video-only or audio-only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub quality_id: u32,
    pub codec: String,
    pub primary_url: String,
    pub backup_urls: Vec<String>,
}

impl StreamDescriptor {
    /// Download URL: the primary one, or the first backup if the primary is
    /// empty.
    pub fn url(&self) -> Option<&str> {
        if !self.primary_url.is_empty() {
            return Some(&self.primary_url);
        }

        self.backup_urls
            .iter()
            .find(|u| !u.is_empty())
            .map(String::as_str)
    }
}

/// Separate video and audio streams of one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashStreams {
    pub video: Vec<StreamDescriptor>,
    pub audio: Vec<StreamDescriptor>,
    pub lossless: Option<StreamDescriptor>,
    pub spatial: Option<Vec<StreamDescriptor>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Dash(DashStreams),
    /// Legacy single stream with audio and video already muxed.
    Combined { url: String },
}

impl Manifest {
    pub fn is_combined(&self) -> bool {
        matches!(self, Manifest::Combined { .. })
    }
}
