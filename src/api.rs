use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_aux::prelude::*;

use crate::{
    ident::{VideoId, VideoRef},
    manifest::{DashStreams, Manifest, StreamDescriptor},
    metadata::{MetadataError, MetadataProvider, PageInfo, VideoInfo},
    util,
};

const VIEW_URL: &str = "https://api.bilibili.com/x/web-interface/view";
const PLAYURL_URL: &str = "https://api.bilibili.com/x/player/playurl";

/// Ask for DASH with HDR, 4K, Dolby audio/video, 8K and AV1.
const FNVAL_ALL_DASH: u32 = 4048;
const LOSSLESS_AUDIO_ID: u32 = 30251;
const SPATIAL_AUDIO_ID: u32 = 30250;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_data(self) -> Result<T, MetadataError> {
        if self.code != 0 {
            return Err(MetadataError::Api {
                code: self.code,
                message: self.message,
            });
        }
        self.data.ok_or(MetadataError::MissingData("data"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct View {
    #[serde(default)]
    pub bvid: String,
    #[serde(default)]
    pub aid: u64,
    pub title: String,
    /// Unix seconds
    #[serde(default)]
    pub pubdate: Option<i64>,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub pages: Vec<Page>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub mid: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Page {
    pub cid: u64,
    pub page: u32,
    #[serde(default)]
    pub part: String,
    #[serde(default)]
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlayUrl {
    #[serde(default)]
    pub quality: u32,
    pub dash: Option<Dash>,
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub durl: Vec<Durl>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Durl {
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Dash {
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub video: Vec<DashStream>,
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub audio: Vec<DashStream>,
    pub dolby: Option<Dolby>,
    pub flac: Option<Flac>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Dolby {
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub audio: Vec<DashStream>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Flac {
    pub audio: Option<DashStream>,
}

/// The API sends both camelCase and snake_case spellings of the URL fields,
/// sometimes only one of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DashStream {
    #[serde(default)]
    pub id: u32,
    #[serde(rename = "baseUrl")]
    pub base_url_camel: Option<String>,
    pub base_url: Option<String>,
    #[serde(
        rename = "backupUrl",
        default,
        deserialize_with = "deserialize_default_from_null"
    )]
    pub backup_url_camel: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub backup_url: Vec<String>,
    #[serde(default)]
    pub codecs: String,
}

impl DashStream {
    fn to_descriptor(&self, default_id: u32) -> StreamDescriptor {
        let backup_urls = if self.backup_url_camel.is_empty() {
            self.backup_url.clone()
        } else {
            self.backup_url_camel.clone()
        };

        StreamDescriptor {
            quality_id: if self.id == 0 { default_id } else { self.id },
            codec: self.codecs.clone(),
            primary_url: self
                .base_url_camel
                .clone()
                .or_else(|| self.base_url.clone())
                .unwrap_or_default(),
            backup_urls,
        }
    }
}

impl View {
    pub fn video_info(&self) -> VideoInfo {
        VideoInfo {
            title: self.title.clone(),
            owner: self.owner.name.clone(),
            duration_secs: self.duration,
            published: self
                .pubdate
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            pages: self
                .pages
                .iter()
                .map(|p| PageInfo {
                    part: p.part.clone(),
                })
                .collect(),
        }
    }
}

impl PlayUrl {
    /// Validate the payload into a manifest: DASH when offered, otherwise the
    /// first legacy segment.
    pub fn into_manifest(self) -> Result<Manifest, MetadataError> {
        if let Some(dash) = self.dash {
            return Ok(Manifest::Dash(DashStreams {
                video: dash.video.iter().map(|s| s.to_descriptor(0)).collect(),
                audio: dash.audio.iter().map(|s| s.to_descriptor(0)).collect(),
                lossless: dash
                    .flac
                    .and_then(|f| f.audio)
                    .map(|s| s.to_descriptor(LOSSLESS_AUDIO_ID)),
                spatial: dash.dolby.map(|d| {
                    d.audio
                        .iter()
                        .map(|s| s.to_descriptor(SPATIAL_AUDIO_ID))
                        .collect()
                }),
            }));
        }

        self.durl
            .into_iter()
            .next()
            .map(|d| Manifest::Combined { url: d.url })
            .ok_or(MetadataError::MissingData("dash or durl"))
    }
}

fn id_query(video: &VideoRef) -> (&'static str, String) {
    match &video.id {
        VideoId::Bvid(bvid) => ("bvid", bvid.clone()),
        VideoId::Aid(aid) => ("aid", aid.to_string()),
    }
}

/// [`MetadataProvider`] backed by the public Bilibili web API.
pub struct BiliApi {
    client: Arc<util::HttpClient>,
    /// Quality id asked from the server; it answers with everything up to it
    /// that the account may access.
    pub max_quality: u32,
    /// Page cids from the last view of each video, so a manifest fetch does
    /// not need the view again.
    cids: Mutex<HashMap<VideoId, Vec<u64>>>,
}

impl BiliApi {
    pub fn new(client: Arc<util::HttpClient>) -> Self {
        Self {
            client,
            max_quality: 127,
            cids: Mutex::new(HashMap::new()),
        }
    }

    fn remember_pages(&self, video: &VideoRef, view: &View) {
        if let Ok(mut cids) = self.cids.lock() {
            cids.insert(video.id.clone(), view.pages.iter().map(|p| p.cid).collect());
        }
    }

    fn cached_cid(&self, video: &VideoRef, page_index: usize) -> Option<u64> {
        let cids = self.cids.lock().ok()?;
        cids.get(&video.id)?.get(page_index).copied()
    }

    async fn page_cid(&self, video: &VideoRef, page_index: usize) -> Result<u64, MetadataError> {
        if let Some(cid) = self.cached_cid(video, page_index) {
            return Ok(cid);
        }

        let view = self.view(video).await?;
        self.remember_pages(video, &view);
        view.pages
            .get(page_index)
            .map(|p| p.cid)
            .ok_or(MetadataError::PageOutOfRange(page_index))
    }

    pub async fn view(&self, video: &VideoRef) -> Result<View, MetadataError> {
        self.client
            .fetch_json::<ApiResponse<View>>(VIEW_URL, &[id_query(video)])
            .await?
            .into_data()
    }

    pub async fn play_url(&self, video: &VideoRef, cid: u64) -> Result<PlayUrl, MetadataError> {
        let (key, value) = id_query(video);
        let key = if key == "aid" { "avid" } else { key };
        let query = [
            (key, value),
            ("cid", cid.to_string()),
            ("qn", self.max_quality.to_string()),
            ("fnval", FNVAL_ALL_DASH.to_string()),
            ("fnver", "0".to_string()),
            ("fourk", "1".to_string()),
        ];

        self.client
            .fetch_json::<ApiResponse<PlayUrl>>(PLAYURL_URL, &query)
            .await?
            .into_data()
    }
}

#[async_trait]
impl MetadataProvider for BiliApi {
    async fn get_info(&self, video: &VideoRef) -> Result<VideoInfo, MetadataError> {
        let view = self.view(video).await?;
        debug!("Fetched view of {} ({} pages)", video, view.pages.len());
        self.remember_pages(video, &view);
        Ok(view.video_info())
    }

    async fn get_manifest(
        &self,
        video: &VideoRef,
        page_index: usize,
    ) -> Result<Manifest, MetadataError> {
        let cid = self.page_cid(video, page_index).await?;
        let play_url = self.play_url(video, cid).await?;
        debug!("Server offered quality {} for cid {}", play_url.quality, cid);
        play_url.into_manifest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIEW_JSON: &str = r#"{
        "code": 0, "message": "0", "ttl": 1,
        "data": {
            "bvid": "BV1xx411c7mD", "aid": 170001, "title": "Test video",
            "pubdate": 1700000000, "duration": 321,
            "owner": {"mid": 2, "name": "uploader", "face": ""},
            "pages": [
                {"cid": 11, "page": 1, "part": "Intro", "duration": 100},
                {"cid": 12, "page": 2, "part": "Main", "duration": 221}
            ]
        }
    }"#;

    const PLAYURL_DASH_JSON: &str = r#"{
        "code": 0, "message": "0",
        "data": {
            "quality": 116,
            "durl": null,
            "dash": {
                "duration": 321,
                "video": [
                    {"id": 116, "baseUrl": "https://v/116", "base_url": "https://v/116",
                     "backupUrl": ["https://bv/116"], "backup_url": ["https://bv/116"],
                     "codecs": "hev1.1.6.L150.90"},
                    {"id": 80, "base_url": "https://v/80", "backup_url": null, "codecs": "avc1.640032"}
                ],
                "audio": [
                    {"id": 30280, "baseUrl": "https://a/30280", "backupUrl": null, "codecs": "mp4a.40.2"}
                ],
                "dolby": {"type": 1, "audio": [
                    {"id": 30250, "baseUrl": "https://a/dolby", "codecs": "ec-3"}
                ]},
                "flac": {"display": true, "audio": {"baseUrl": "https://a/flac", "codecs": "fLaC"}}
            }
        }
    }"#;

    #[test]
    fn parse_view() {
        let view = serde_json::from_str::<ApiResponse<View>>(VIEW_JSON)
            .unwrap()
            .into_data()
            .unwrap();
        let info = view.video_info();

        assert_eq!(info.title, "Test video");
        assert_eq!(info.owner, "uploader");
        assert_eq!(info.duration_secs, 321);
        assert_eq!(info.pages.len(), 2);
        assert_eq!(info.pages[1].part, "Main");
        assert_eq!(view.pages[1].cid, 12);
        assert_eq!(info.published.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn view_with_only_title_and_pages() {
        let json = r#"{"code": 0, "data": {
            "title": "Sparse", "pubdate": null,
            "pages": [{"cid": 7, "page": 1, "part": ""}]
        }}"#;
        let view = serde_json::from_str::<ApiResponse<View>>(json)
            .unwrap()
            .into_data()
            .unwrap();
        let info = view.video_info();

        assert_eq!(info.title, "Sparse");
        assert_eq!(info.owner, "");
        assert_eq!(info.published, None);
        assert_eq!(info.pages.len(), 1);
    }

    #[test]
    fn page_cids_are_remembered() {
        let api = BiliApi::new(Arc::new(util::HttpClient::new().unwrap()));
        let video = crate::ident::parse("BV1xx411c7mD").unwrap();
        assert_eq!(api.cached_cid(&video, 0), None);

        let view = serde_json::from_str::<ApiResponse<View>>(VIEW_JSON)
            .unwrap()
            .into_data()
            .unwrap();
        api.remember_pages(&video, &view);

        // Any page of the same video shares the entry
        let page_two = video.with_page(2);
        assert_eq!(api.cached_cid(&page_two, 0), Some(11));
        assert_eq!(api.cached_cid(&page_two, 1), Some(12));
        assert_eq!(api.cached_cid(&video, 2), None);

        let other = crate::ident::parse("av170001").unwrap();
        assert_eq!(api.cached_cid(&other, 0), None);
    }

    #[test]
    fn parse_dash_manifest() {
        let manifest = serde_json::from_str::<ApiResponse<PlayUrl>>(PLAYURL_DASH_JSON)
            .unwrap()
            .into_data()
            .unwrap()
            .into_manifest()
            .unwrap();

        let Manifest::Dash(dash) = manifest else {
            panic!("expected DASH manifest");
        };
        assert_eq!(dash.video.len(), 2);
        assert_eq!(dash.video[0].primary_url, "https://v/116");
        assert_eq!(dash.video[0].backup_urls, vec!["https://bv/116"]);
        assert_eq!(dash.video[1].url(), Some("https://v/80"));
        assert!(dash.video[1].backup_urls.is_empty());
        assert_eq!(dash.audio[0].quality_id, 30280);

        // Missing id on the lossless track gets its well-known id
        let lossless = dash.lossless.unwrap();
        assert_eq!(lossless.quality_id, LOSSLESS_AUDIO_ID);
        assert_eq!(lossless.primary_url, "https://a/flac");
        assert_eq!(dash.spatial.unwrap()[0].quality_id, 30250);
    }

    #[test]
    fn parse_legacy_manifest() {
        let json = r#"{"code": 0, "data": {"quality": 32, "durl": [{"url": "https://f/1.flv", "size": 10}]}}"#;
        let manifest = serde_json::from_str::<ApiResponse<PlayUrl>>(json)
            .unwrap()
            .into_data()
            .unwrap()
            .into_manifest()
            .unwrap();
        assert_eq!(
            manifest,
            Manifest::Combined {
                url: "https://f/1.flv".into()
            }
        );

        let json = r#"{"code": 0, "data": {"quality": 32}}"#;
        let res = serde_json::from_str::<ApiResponse<PlayUrl>>(json)
            .unwrap()
            .into_data()
            .unwrap()
            .into_manifest();
        assert!(matches!(res, Err(MetadataError::MissingData(_))));
    }

    #[test]
    fn api_error_code() {
        let json = r#"{"code": -404, "message": "啥都木有", "data": null}"#;
        let res = serde_json::from_str::<ApiResponse<View>>(json)
            .unwrap()
            .into_data();
        assert!(matches!(res, Err(MetadataError::Api { code: -404, .. })));
    }

    #[test]
    fn empty_dolby_and_flac() {
        let json = r#"{"code": 0, "data": {"dash": {
            "video": [], "audio": null,
            "dolby": {"type": 0, "audio": null},
            "flac": null
        }}}"#;
        let manifest = serde_json::from_str::<ApiResponse<PlayUrl>>(json)
            .unwrap()
            .into_data()
            .unwrap()
            .into_manifest()
            .unwrap();
        let Manifest::Dash(dash) = manifest else {
            panic!("expected DASH manifest");
        };
        assert!(dash.audio.is_empty());
        assert!(dash.lossless.is_none());
        assert_eq!(dash.spatial, Some(Vec::new()));
    }
}
