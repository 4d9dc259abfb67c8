use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use url::Url;

use super::media_id::MediaId;
use crate::config::HostRewrite;

/// Keys every record carries, partial or full.
pub const PARTIAL_KEYS: &[&str] = &[
    "mediaId",
    "full",
    "illustType",
    "illustTitle",
    "userId",
    "userName",
    "pageCount",
    "width",
    "height",
    "previewUrls",
    "bookmarkData",
    "createDate",
    "tagList",
    "aiGenerated",
    "extraData",
];

/// Keys only present on full records.
pub const FULL_ONLY_KEYS: &[&str] = &[
    "description",
    "likeCount",
    "bookmarkCount",
    "viewCount",
    "urls",
    "mangaPages",
    "ugoiraMetadata",
];

/// User edits for one page, keyed by field name. "mediaId" and "editedAt" are bookkeeping.
pub type ExtraImageData = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    Illustration,
    Manga,
    Animation,
    Video,
}

impl WorkType {
    fn from_remote(value: u32) -> Self {
        match value {
            1 => WorkType::Manga,
            2 => WorkType::Animation,
            _ => WorkType::Illustration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkData {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUrls {
    #[serde(default, alias = "thumb_mini")]
    pub mini: String,
    #[serde(default)]
    pub thumb: String,
    #[serde(default)]
    pub small: String,
    #[serde(default)]
    pub regular: String,
    #[serde(default)]
    pub original: String,
}

impl ImageUrls {
    fn rewrite_hosts(&mut self, rewrites: &[HostRewrite]) {
        for url in [
            &mut self.mini,
            &mut self.thumb,
            &mut self.small,
            &mut self.regular,
            &mut self.original,
        ] {
            *url = adjust_image_url(url, rewrites);
        }
    }

    /// The best available preview: small, then regular, then thumb.
    fn preview(&self) -> &str {
        [&self.small, &self.regular, &self.thumb, &self.mini]
            .into_iter()
            .find(|url| !url.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaPage {
    #[serde(deserialize_with = "lenient_u32")]
    pub width: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub height: u32,
    #[serde(default)]
    pub urls: ImageUrls,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UgoiraFrame {
    pub file: String,
    pub delay: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UgoiraMetadata {
    pub src: String,
    #[serde(default)]
    pub original_src: String,
    #[serde(default, alias = "mime_type")]
    pub mime_type: String,
    pub frames: Vec<UgoiraFrame>,
}

/// Fields only known once a work's full info has been loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullDetails {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub bookmark_count: u64,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub urls: ImageUrls,
    pub manga_pages: Vec<MangaPage>,
    #[serde(default)]
    pub ugoira_metadata: Option<UgoiraMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub media_id: MediaId,
    pub full: bool,
    pub illust_type: WorkType,
    pub illust_title: String,
    pub user_id: String,
    pub user_name: String,
    pub page_count: u32,
    pub width: u32,
    pub height: u32,
    /// One preview URL per page.
    pub preview_urls: Vec<String>,
    pub bookmark_data: Option<BookmarkData>,
    pub create_date: String,
    pub tag_list: Vec<String>,
    pub ai_generated: bool,
    pub extra_data: BTreeMap<MediaId, ExtraImageData>,
    #[serde(flatten)]
    pub details: Option<FullDetails>,
}

impl MediaInfo {
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// A copy holding only the partial fields.
    pub fn to_partial(&self) -> MediaInfo {
        MediaInfo {
            full: false,
            details: None,
            ..self.clone()
        }
    }

    pub fn manga_pages(&self) -> &[MangaPage] {
        self.details
            .as_ref()
            .map(|details| details.manga_pages.as_slice())
            .unwrap_or(&[])
    }

    /// Return the edits stored for one page of this work.
    pub fn extra_data_for(&self, media_id: &MediaId) -> Option<&ExtraImageData> {
        self.extra_data.get(media_id)
    }

    /// Apply a field patch, returning the patched record.
    ///
    /// Keys that aren't legal for this record's completeness, or that would change its identity,
    /// are skipped with a warning.
    pub fn patched(&self, fields: &Map<String, Value>) -> Result<MediaInfo, serde_json::Error> {
        let mut record = match serde_json::to_value(self)? {
            Value::Object(record) => record,
            _ => return Ok(self.clone()),
        };

        for (key, field) in fields {
            if key == "mediaId" || key == "full" {
                log::warn!("Refusing to change {key} of {}", self.media_id);
                continue;
            }

            let legal = PARTIAL_KEYS.contains(&key.as_str())
                || (self.full && FULL_ONLY_KEYS.contains(&key.as_str()));
            if !legal {
                log::warn!(
                    "Ignoring update of {key} on {} ({} info)",
                    self.media_id,
                    if self.full { "full" } else { "partial" }
                );
                continue;
            }

            record.insert(key.clone(), field.clone());
        }

        serde_json::from_value(Value::Object(record))
    }
}

/// Check a raw record against the schema for its completeness, logging mismatches.
///
/// Returns true if the record has every required key and nothing else.
pub fn check_record_keys(record: &Map<String, Value>, full: bool) -> bool {
    let mut ok = true;
    let media_id = record
        .get("mediaId")
        .and_then(Value::as_str)
        .unwrap_or("(unknown)");

    for key in PARTIAL_KEYS {
        if !record.contains_key(*key) {
            log::warn!("Media info for {media_id} is missing key {key}");
            ok = false;
        }
    }

    if full {
        for key in FULL_ONLY_KEYS {
            if !record.contains_key(*key) {
                log::warn!("Full media info for {media_id} is missing key {key}");
                ok = false;
            }
        }
    }

    for key in record.keys() {
        let expected = PARTIAL_KEYS.contains(&key.as_str())
            || (full && FULL_ONLY_KEYS.contains(&key.as_str()));
        if !expected {
            log::warn!(
                "Unexpected key {key} in {} media info for {media_id}",
                if full { "full" } else { "partial" }
            );
            ok = false;
        }
    }

    ok
}

/// Rewrite an image URL's hostname for CDN routing. URLs that don't parse are returned unchanged.
pub fn adjust_image_url(url: &str, rewrites: &[HostRewrite]) -> String {
    if url.is_empty() || rewrites.is_empty() {
        return url.to_string();
    }

    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };

    let Some(rewrite) = rewrites
        .iter()
        .find(|rewrite| parsed.host_str() == Some(rewrite.from.as_str()))
    else {
        return url.to_string();
    };

    if parsed.set_host(Some(&rewrite.to)).is_err() {
        return url.to_string();
    }
    parsed.to_string()
}

/// One work as it appears in search listings and batch thumbnail requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailData {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub illust_type: u32,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default = "one", deserialize_with = "lenient_u32")]
    pub page_count: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub width: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub height: u32,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub bookmark_data: Option<BookmarkData>,
    #[serde(default)]
    pub create_date: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ai_type: u32,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

fn one() -> u32 {
    1
}

impl ThumbnailData {
    pub fn media_id(&self) -> Option<MediaId> {
        format!("work:{}", self.id).parse().ok()
    }

    pub fn into_media_info(self, rewrites: &[HostRewrite]) -> Option<MediaInfo> {
        let media_id = self.media_id()?;
        let preview = adjust_image_url(&self.url, rewrites);

        Some(MediaInfo {
            media_id,
            full: false,
            illust_type: WorkType::from_remote(self.illust_type),
            illust_title: self.title,
            user_id: self.user_id,
            user_name: self.user_name,
            page_count: self.page_count.max(1),
            width: self.width,
            height: self.height,
            // Listings only give a preview for the first page.
            preview_urls: vec![preview],
            bookmark_data: self.bookmark_data,
            create_date: self.create_date,
            tag_list: self.tags,
            ai_generated: self.ai_type == 2,
            extra_data: BTreeMap::new(),
            details: None,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailTags {
    #[serde(default)]
    pub tags: Vec<DetailTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailTag {
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIllust {
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// The body of a single-work detail request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IllustDetail {
    #[serde(deserialize_with = "lenient_string")]
    pub illust_id: String,
    #[serde(default)]
    pub illust_title: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub illust_type: u32,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default = "one", deserialize_with = "lenient_u32")]
    pub page_count: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub width: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub height: u32,
    #[serde(default)]
    pub urls: ImageUrls,
    #[serde(default)]
    pub tags: DetailTags,
    #[serde(default)]
    pub bookmark_data: Option<BookmarkData>,
    #[serde(default)]
    pub create_date: String,
    #[serde(default)]
    pub ai_type: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub bookmark_count: u64,
    #[serde(default)]
    pub view_count: u64,
    /// A few of the author's other works. Values are null for works that aren't included.
    #[serde(default)]
    pub user_illusts: HashMap<String, Option<UserIllust>>,
}

impl IllustDetail {
    pub fn work_type(&self) -> WorkType {
        WorkType::from_remote(self.illust_type)
    }

    /// The first avatar URL carried by the author's other works, if any.
    pub fn author_avatar(&self) -> Option<&str> {
        self.user_illusts
            .values()
            .flatten()
            .find_map(|illust| illust.profile_image_url.as_deref())
    }

    /// Build a full record from this detail. Manga pages and animation data are filled in
    /// by the caller once their secondary requests finish.
    pub fn into_media_info(mut self, media_id: MediaId, rewrites: &[HostRewrite]) -> MediaInfo {
        self.urls.rewrite_hosts(rewrites);
        let tag_list = self.tags.tags.into_iter().map(|tag| tag.tag).collect();
        let preview = self.urls.preview().to_string();

        MediaInfo {
            media_id,
            full: true,
            illust_type: WorkType::from_remote(self.illust_type),
            illust_title: self.illust_title,
            user_id: self.user_id,
            user_name: self.user_name,
            page_count: self.page_count.max(1),
            width: self.width,
            height: self.height,
            preview_urls: vec![preview],
            bookmark_data: self.bookmark_data,
            create_date: self.create_date,
            tag_list,
            ai_generated: self.ai_type == 2,
            extra_data: BTreeMap::new(),
            details: Some(FullDetails {
                description: self.description,
                like_count: self.like_count,
                bookmark_count: self.bookmark_count,
                view_count: self.view_count,
                urls: self.urls,
                manga_pages: Vec::new(),
                ugoira_metadata: None,
            }),
        }
    }
}

impl MediaInfo {
    /// Fill in per-page data from a manga pages response, or synthesize a single page
    /// from the top-level URLs when there's only one.
    pub(crate) fn set_manga_pages(&mut self, pages: Option<Vec<MangaPage>>, rewrites: &[HostRewrite]) {
        let Some(details) = self.details.as_mut() else {
            return;
        };

        let pages = match pages {
            Some(mut pages) => {
                for page in &mut pages {
                    page.urls.rewrite_hosts(rewrites);
                }
                pages
            }
            None => vec![MangaPage {
                width: self.width,
                height: self.height,
                urls: details.urls.clone(),
            }],
        };

        self.preview_urls = pages
            .iter()
            .map(|page| page.urls.preview().to_string())
            .collect();
        details.manga_pages = pages;
    }

    pub(crate) fn set_ugoira_metadata(&mut self, mut metadata: UgoiraMetadata, rewrites: &[HostRewrite]) {
        metadata.src = adjust_image_url(&metadata.src, rewrites);
        metadata.original_src = adjust_image_url(&metadata.original_src, rewrites);
        if let Some(details) = self.details.as_mut() {
            details.ugoira_metadata = Some(metadata);
        }
    }
}

/// Accept a string or a number, since the remote API isn't consistent about IDs.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| de::Error::custom(format!("{n} is out of range"))),
        Value::String(s) => s.parse().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("expected a number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::key_set;
    use serde_json::json;

    fn thumbnail() -> ThumbnailData {
        serde_json::from_value(json!({
            "id": 42,
            "title": "Sunset",
            "illustType": "1",
            "userId": "9",
            "userName": "someone",
            "pageCount": 3,
            "width": 800,
            "height": 600,
            "url": "https://i.pximg.net/c/250x250/img/42_p0.jpg",
            "bookmarkData": null,
            "createDate": "2024-01-01T00:00:00+09:00",
            "tags": ["sky", "orange"],
            "aiType": 2
        }))
        .unwrap()
    }

    fn rewrites() -> Vec<HostRewrite> {
        vec![HostRewrite {
            from: "i.pximg.net".into(),
            to: "i-cf.pximg.net".into(),
        }]
    }

    #[test]
    fn test_thumbnail_conversion() {
        let info = thumbnail().into_media_info(&rewrites()).unwrap();
        assert_eq!(info.media_id.to_string(), "work:42");
        assert_eq!(info.illust_type, WorkType::Manga);
        assert!(info.ai_generated);
        assert!(!info.full);
        assert_eq!(
            info.preview_urls,
            vec!["https://i-cf.pximg.net/c/250x250/img/42_p0.jpg".to_string()]
        );

        let mut expected: Vec<String> = PARTIAL_KEYS.iter().map(|k| k.to_string()).collect();
        expected.sort();
        assert_eq!(key_set(&info), expected);
    }

    #[test]
    fn test_partial_roundtrip_has_no_details() {
        let info = thumbnail().into_media_info(&[]).unwrap();
        let value = serde_json::to_value(&info).unwrap();
        let back: MediaInfo = serde_json::from_value(value).unwrap();
        assert!(back.details.is_none());
        assert_eq!(back, info);
    }

    #[test]
    fn test_patch_rejects_full_only_keys_on_partial() {
        let info = thumbnail().into_media_info(&[]).unwrap();
        let mut fields = Map::new();
        fields.insert("likeCount".into(), json!(5));
        fields.insert("illustTitle".into(), json!("Renamed"));
        fields.insert("full".into(), json!(true));

        let patched = info.patched(&fields).unwrap();
        assert_eq!(patched.illust_title, "Renamed");
        assert!(!patched.full);
        assert!(patched.details.is_none());
    }

    #[test]
    fn test_check_record_keys() {
        let info = thumbnail().into_media_info(&[]).unwrap();
        let Value::Object(mut map) = serde_json::to_value(&info).unwrap() else {
            unreachable!()
        };
        assert!(check_record_keys(&map, false));
        assert!(!check_record_keys(&map, true));

        map.insert("bogus".into(), json!(1));
        assert!(!check_record_keys(&map, false));
    }

    #[test]
    fn test_single_page_synthesis() {
        let detail: IllustDetail = serde_json::from_value(json!({
            "illustId": "5",
            "illustTitle": "One",
            "illustType": 0,
            "pageCount": 1,
            "width": 100,
            "height": 200,
            "urls": {"small": "https://i.pximg.net/s.jpg", "original": "https://i.pximg.net/o.png"},
            "tags": {"tags": [{"tag": "a"}]},
            "userIllusts": {"4": null, "3": {"profileImageUrl": "https://i.pximg.net/u.png"}}
        }))
        .unwrap();
        assert_eq!(detail.author_avatar(), Some("https://i.pximg.net/u.png"));

        let mut info = detail.into_media_info(MediaId::work("5"), &rewrites());
        info.set_manga_pages(None, &rewrites());
        let pages = info.manga_pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].width, 100);
        assert_eq!(pages[0].urls.original, "https://i-cf.pximg.net/o.png");
        assert_eq!(info.tag_list, vec!["a".to_string()]);
    }
}
