use std::{io, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_LENGTH, REFERER, USER_AGENT},
    Url,
};
use reqwest_cookie_store::CookieStoreMutex;
use serde::de::DeserializeOwned;

use crate::{
    config::{DEFAULT_REFERER, DEFAULT_USER_AGENT},
    download::{StreamHandle, Transport, TransportError},
};

const COOKIE_URL: &str = "https://www.bilibili.com";

/// Session cookies of a logged-in account. Obtaining and storing them is up
/// to the caller.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub sessdata: String,
    pub bili_jct: Option<String>,
    pub buvid3: Option<String>,
}

pub struct HttpClient {
    pub client: reqwest::Client,
    pub cookies: Arc<CookieStoreMutex>,
}

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    #[error("could not store cookie: {0}")]
    Cookie(String),
}

impl HttpClient {
    pub fn new() -> Result<HttpClient, HttpError> {
        let cookies = Arc::new(CookieStoreMutex::default());

        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static(DEFAULT_REFERER));
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        let client = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .default_headers(headers)
            .build()?;

        Ok(HttpClient { client, cookies })
    }

    pub fn with_credential(credential: &Credential) -> Result<HttpClient, HttpError> {
        let client = Self::new()?;
        client.add_credential(credential)?;
        Ok(client)
    }

    pub fn add_credential(&self, credential: &Credential) -> Result<(), HttpError> {
        let url = Url::parse(COOKIE_URL).map_err(|e| HttpError::Cookie(e.to_string()))?;
        let mut store = self
            .cookies
            .lock()
            .map_err(|e| HttpError::Cookie(e.to_string()))?;

        let pairs = [
            ("SESSDATA", Some(&credential.sessdata)),
            ("bili_jct", credential.bili_jct.as_ref()),
            ("buvid3", credential.buvid3.as_ref()),
        ];
        for (name, value) in pairs {
            let Some(value) = value else { continue };
            let cookie = format!("{}={}; Domain=.bilibili.com; Path=/", name, value);
            store
                .parse(&cookie, &url)
                .map_err(|e| HttpError::Cookie(e.to_string()))?;
        }

        Ok(())
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, HttpError> {
        let resp = self.client.get(url).query(query).send().await?;
        if !resp.status().is_success() {
            return Err(HttpError::Status(resp.status()));
        }
        resp.json().await.map_err(|e| e.into())
    }
}

struct ResponseStream {
    resp: reqwest::Response,
    content_length: u64,
}

#[async_trait]
impl StreamHandle for ResponseStream {
    fn content_length(&self) -> u64 {
        self.content_length
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.resp.chunk().await.map_err(|e| e.into())
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn open(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Box<dyn StreamHandle>, TransportError> {
        let resp = self
            .client
            .get(url)
            .headers(headers.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }

        let content_length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok()?.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Box::new(ResponseStream {
            resp,
            content_length,
        }))
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "KiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "MiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "GiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "TiB";
    }

    format!("{:.2} {}", bytes, suffix)
}

/// Human-scaled transfer rate, e.g. `1.5 MB/s`.
pub fn format_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec > 1024.0 * 1024.0 {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else if bytes_per_sec > 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

const DEFAULT_FILENAME: &str = "video";
const MAX_FILENAME_CHARS: usize = 200;

/// Make a title usable as a file name on every common filesystem.
///
/// Reserved characters and control characters are removed, surrounding
/// spaces and dots trimmed and the result capped at 200 characters. Never
/// returns an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .collect();
    let cleaned: String = cleaned
        .trim_matches(|c| c == ' ' || c == '.')
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_end_matches(|c| c == ' ' || c == '.');

    if cleaned.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Move a file, copying across filesystems when a rename is not possible.
pub async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Remove a file, ignoring it if it does not exist.
pub async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_reserved_characters() {
        assert_eq!(sanitize_filename("a<b>c?.mp4"), "abc.mp4");
        assert_eq!(sanitize_filename(r#"x:y"z/w\v|u*t"#), "xyzwvut");
        assert_eq!(sanitize_filename("tab\there\u{1}"), "tabhere");
        assert_eq!(sanitize_filename("  ..title..  "), "title");
        assert_eq!(sanitize_filename("【中文】标题"), "【中文】标题");
    }

    #[test]
    fn sanitize_never_empty() {
        assert_eq!(sanitize_filename(""), "video");
        assert_eq!(sanitize_filename("???"), "video");
        assert_eq!(sanitize_filename(" . . "), "video");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_filename(&long).chars().count(), 200);
    }

    #[test]
    fn rates() {
        assert_eq!(format_rate(512.0), "512 B/s");
        assert_eq!(format_rate(2048.0), "2.0 KB/s");
        assert_eq!(format_rate(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
        assert_eq!(format_bytes(2048), "2.00 KiB");
    }

    #[test]
    fn credential_cookies_are_sent_to_bilibili() {
        let client = HttpClient::with_credential(&Credential {
            sessdata: "abc".to_string(),
            bili_jct: Some("def".to_string()),
            buvid3: None,
        })
        .unwrap();

        let store = client.cookies.lock().unwrap();
        let url = Url::parse("https://api.bilibili.com/x/web-interface/view").unwrap();
        let mut names: Vec<String> = store
            .matches(&url)
            .iter()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["SESSDATA=abc", "bili_jct=def"]);

        let other = Url::parse("https://example.com/").unwrap();
        assert!(store.matches(&other).is_empty());
    }

    #[tokio::test]
    async fn move_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.bin");
        let to = dir.path().join("nested/b.bin");
        std::fs::write(&from, b"data").unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"data");

        remove_if_exists(&to).await;
        remove_if_exists(&to).await;
        assert!(!to.exists());
    }
}
