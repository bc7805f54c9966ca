use std::{env, path::PathBuf};

use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};

use crate::select::{Priorities, Quality};

pub const DEFAULT_REFERER: &str = "https://www.bilibili.com";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Settings for a download job.
#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    /// Temp files are written here and nowhere else.
    pub scratch_dir: PathBuf,
    pub quality: Quality,
    pub priorities: Priorities,
    pub ffmpeg: PathBuf,
    /// Extension of the final container.
    pub container_ext: String,
    /// Download video and audio at the same time instead of one after the
    /// other.
    pub concurrent_streams: bool,
    pub referer: String,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            scratch_dir: PathBuf::from("cache"),
            quality: Quality::Auto,
            priorities: Priorities::default(),
            ffmpeg: PathBuf::from("ffmpeg"),
            container_ext: "mp4".to_string(),
            concurrent_streams: false,
            referer: DEFAULT_REFERER.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by `BVDL_*` environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("BVDL_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("BVDL_CACHE_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }
        if let Ok(name) = env::var("BVDL_QUALITY") {
            match Quality::from_name(&name) {
                Some(q) => config.quality = q,
                None => warn!("Ignoring unknown quality {:?}", name),
            }
        }
        if let Ok(path) = env::var("BVDL_FFMPEG") {
            config.ffmpeg = PathBuf::from(path);
        }
        if let Ok(flag) = env::var("BVDL_CONCURRENT") {
            config.concurrent_streams = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Headers sent with every stream request; the CDN rejects requests
    /// without a referer.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&self.referer) {
            Ok(v) => {
                headers.insert(REFERER, v);
            }
            Err(_) => warn!("Invalid referer {:?}", self.referer),
        }
        match HeaderValue::from_str(&self.user_agent) {
            Ok(v) => {
                headers.insert(USER_AGENT, v);
            }
            Err(_) => warn!("Invalid user agent {:?}", self.user_agent),
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_headers() {
        let headers = Config::default().request_headers();
        assert_eq!(headers.get(REFERER).unwrap(), DEFAULT_REFERER);
        assert!(headers.contains_key(USER_AGENT));
    }

    #[test]
    fn bad_header_values_are_skipped() {
        let config = Config {
            referer: "bad\nvalue".to_string(),
            ..Default::default()
        };
        let headers = config.request_headers();
        assert!(!headers.contains_key(REFERER));
        assert!(headers.contains_key(USER_AGENT));
    }
}
