use std::{fmt, sync::OnceLock};

use regex::Regex;
use url::Url;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Could not find a video id in {0:?}")]
    NoVideoId(String),
    #[error("Invalid page number {0:?}")]
    InvalidPage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VideoId {
    Bvid(String),
    Aid(u64),
}

/// A resolved video reference: exactly one id plus a 1-based page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoRef {
    pub id: VideoId,
    pub page: u32,
}

impl VideoRef {
    pub fn bvid(&self) -> Option<&str> {
        match &self.id {
            VideoId::Bvid(bvid) => Some(bvid),
            VideoId::Aid(_) => None,
        }
    }

    pub fn aid(&self) -> Option<u64> {
        match self.id {
            VideoId::Aid(aid) => Some(aid),
            VideoId::Bvid(_) => None,
        }
    }

    pub fn with_page(&self, page: u32) -> Self {
        Self {
            id: self.id.clone(),
            page,
        }
    }
}

impl fmt::Display for VideoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            VideoId::Bvid(bvid) => write!(f, "{} (P{})", bvid, self.page),
            VideoId::Aid(aid) => write!(f, "av{} (P{})", aid, self.page),
        }
    }
}

fn re_bare_aid() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^av(\d+)$").expect("valid regex"))
}

fn re_path_bvid() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)BV[a-z0-9]{10}").expect("valid regex"))
}

fn re_path_aid() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)av(\d+)").expect("valid regex"))
}

fn parse_aid(digits: &str, input: &str) -> Result<u64, ParseError> {
    digits
        .parse()
        .map_err(|_| ParseError::NoVideoId(input.to_string()))
}

fn parse_page(url: &Url) -> Result<u32, ParseError> {
    match url.query_pairs().find(|(k, _)| k == "p") {
        Some((_, v)) => match v.parse::<u32>() {
            Ok(page) if page >= 1 => Ok(page),
            _ => Err(ParseError::InvalidPage(v.into_owned())),
        },
        None => Ok(1),
    }
}

/// Parse a raw `BV…`/`av…` id or a video page URL.
pub fn parse(input: &str) -> Result<VideoRef, ParseError> {
    let input = input.trim();

    let bv_prefix = input
        .get(..2)
        .map_or(false, |p| p.eq_ignore_ascii_case("BV"));
    if bv_prefix && input.chars().count() <= 12 {
        return Ok(VideoRef {
            id: VideoId::Bvid(input.to_string()),
            page: 1,
        });
    }

    if let Some(caps) = re_bare_aid().captures(input) {
        return Ok(VideoRef {
            id: VideoId::Aid(parse_aid(&caps[1], input)?),
            page: 1,
        });
    }

    // Accept scheme-less links such as `www.bilibili.com/video/BV...`
    let url = Url::parse(input)
        .or_else(|_| Url::parse(&format!("https://{}", input)))
        .map_err(|_| ParseError::NoVideoId(input.to_string()))?;
    let path = url.path();

    let id = if let Some(m) = re_path_bvid().find(path) {
        VideoId::Bvid(m.as_str().to_string())
    } else if let Some(caps) = re_path_aid().captures(path) {
        VideoId::Aid(parse_aid(&caps[1], input)?)
    } else {
        return Err(ParseError::NoVideoId(input.to_string()));
    };

    Ok(VideoRef {
        id,
        page: parse_page(&url)?,
    })
}
