use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::url_state::UrlState;
use crate::backend::api::{ApiClient, LocalApi};
use crate::backend::media_cache::{InfoOptions, MediaCache};
use crate::backend::media_id::MediaId;
use crate::config::Settings;

/// What a data source needs to load pages.
#[derive(Clone)]
pub struct Sources {
    pub api: Arc<dyn ApiClient>,
    pub local_api: Option<Arc<dyn LocalApi>>,
    pub media: MediaCache,
}

/// Static facts about a kind of data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: &'static str,
    /// Results change on every visit, so the source isn't kept once it's navigated away from.
    pub transient: bool,
    /// The listing has an entry for every page of multi-page works, not just the first.
    pub includes_manga_pages: bool,
}

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageResult {
    pub media_ids: Vec<MediaId>,
    /// The source says there are pages after this one. An empty page with this set
    /// isn't the end of the results.
    pub has_more: bool,
}

/// How a data source gets its pages.
pub enum PageProvider {
    /// Work IDs scraped out of an HTML page, in order of appearance.
    ScrapeHtml {
        path: String,
        params: Vec<(String, String)>,
    },
    /// A paginated JSON API that returns thumbnail data for each page.
    JsonApi {
        path: String,
        params: Vec<(String, String)>,
    },
    /// One request returns every ID at once, which is then split into pages.
    Prefetched {
        path: String,
        page_size: usize,
        ids: OnceCell<Vec<MediaId>>,
    },
    /// The pages of a single work, one entry per page.
    WorkPages { work: MediaId },
    /// A folder listing from the local file API.
    Local { folder: String },
}

impl PageProvider {
    /// Pick the provider for a URL.
    pub fn for_url(url: &UrlState, settings: &Settings) -> (PageProvider, SourceInfo) {
        let info = |name| SourceInfo {
            name,
            transient: false,
            includes_manga_pages: false,
        };

        if url.url().scheme() == "file" {
            let folder = decode(url.path());
            return (PageProvider::Local { folder }, info("local"));
        }

        let segments: Vec<String> = url
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(decode)
            .collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        let query_or = |key: &str, default: &str| {
            url.query_arg(key).unwrap_or_else(|| default.to_string())
        };

        let search_tag = match segments.as_slice() {
            ["tags", tag, ..] => Some(tag.to_string()),
            ["search"] => url.query_arg("tag").or_else(|| url.query_arg("word")),
            _ => None,
        };
        if let Some(tag) = search_tag {
            let provider = PageProvider::JsonApi {
                path: format!("/ajax/search/artworks/{}", urlencoding::encode(&tag)),
                params: vec![
                    ("word".to_string(), tag),
                    ("order".to_string(), query_or("order", "date_d")),
                    ("mode".to_string(), query_or("mode", "all")),
                    ("s_mode".to_string(), query_or("s_mode", "s_tag")),
                ],
            };
            return (provider, info("search"));
        }

        let manga_work = match segments.as_slice() {
            ["artworks", work_id] if url.hash_arg("manga").is_some() => {
                match MediaId::parse_work(work_id) {
                    Ok(work) => Some(work),
                    Err(e) => {
                        log::warn!("Not showing manga pages: {e}");
                        None
                    }
                }
            }
            _ => None,
        };
        if let Some(work) = manga_work {
            let info = SourceInfo {
                includes_manga_pages: true,
                ..info("manga")
            };
            return (PageProvider::WorkPages { work }, info);
        }

        match segments.as_slice() {
            ["local", rest @ ..] => {
                let folder = format!("/{}", rest.join("/"));
                (PageProvider::Local { folder }, info("local"))
            }
            ["users", user_id] | ["users", user_id, "artworks" | "illustrations" | "manga"] => {
                let provider = PageProvider::Prefetched {
                    path: format!("/ajax/user/{user_id}/profile/all"),
                    page_size: settings.prefetched_page_size.max(1),
                    ids: OnceCell::new(),
                };
                (provider, info("artist"))
            }
            ["bookmark_new_illust.php"] => {
                let provider = PageProvider::JsonApi {
                    path: "/ajax/follow_latest/illust".to_string(),
                    params: vec![("mode".to_string(), query_or("mode", "all"))],
                };
                (provider, info("following"))
            }
            ["discovery"] => {
                let provider = PageProvider::JsonApi {
                    path: "/ajax/discovery/artworks".to_string(),
                    params: vec![
                        ("mode".to_string(), query_or("mode", "all")),
                        ("limit".to_string(), "60".to_string()),
                    ],
                };
                let info = SourceInfo {
                    transient: true,
                    ..info("discovery")
                };
                (provider, info)
            }
            _ => {
                let provider = PageProvider::ScrapeHtml {
                    path: url.path().to_string(),
                    params: url.query_pairs_without_page(),
                };
                (provider, info("vanilla"))
            }
        }
    }

    /// Load one page. Pages start at 1.
    pub async fn load(&self, page: u32, sources: &Sources) -> Result<PageResult, String> {
        match self {
            PageProvider::ScrapeHtml { path, params } => {
                let body = sources
                    .api
                    .get_html(path, &with_page_param(params, page))
                    .await
                    .into_body()?;
                let html = body.as_str().unwrap_or_default();
                let media_ids = scrape_work_ids(html);

                // Scraped pages carry no info, so load it now so the results can be shown.
                sources.media.batch_get_media_info_partial(&media_ids).await;
                Ok(PageResult {
                    media_ids,
                    has_more: false,
                })
            }
            PageProvider::JsonApi { path, params } => {
                let body = sources
                    .api
                    .get(path, &with_page_param(params, page))
                    .await
                    .into_body()?;
                let (works, has_more) = search_results(body, page);
                let media_ids = sources.media.add_media_infos_partial(works).await;
                Ok(PageResult {
                    media_ids,
                    has_more,
                })
            }
            PageProvider::Prefetched {
                path,
                page_size,
                ids,
            } => {
                let all = ids
                    .get_or_try_init(|| async {
                        let body = sources.api.get(path, &[]).await.into_body()?;
                        Ok::<_, String>(prefetched_ids(&body))
                    })
                    .await?;

                let start = (page.saturating_sub(1) as usize).saturating_mul(*page_size);
                let end = start.saturating_add(*page_size).min(all.len());
                let media_ids = all.get(start..end).unwrap_or_default().to_vec();
                sources.media.batch_get_media_info_partial(&media_ids).await;
                Ok(PageResult {
                    media_ids,
                    has_more: false,
                })
            }
            PageProvider::WorkPages { work } => {
                if page != 1 {
                    return Ok(PageResult::default());
                }
                let Some(info) = sources.media.get_media_info(work, InfoOptions::FULL).await
                else {
                    return Err(sources
                        .media
                        .get_media_load_error(work)
                        .unwrap_or_else(|| "Error loading data".to_string()));
                };

                let page_count = info.page_count.max(1);
                Ok(PageResult {
                    media_ids: (0..page_count).map(|page| work.with_page(page)).collect(),
                    has_more: false,
                })
            }
            PageProvider::Local { folder } => {
                let Some(local_api) = &sources.local_api else {
                    return Err("Local files aren't available".to_string());
                };
                let response = local_api
                    .request("/api/list", json!({ "path": folder, "page": page }))
                    .await;
                let has_more = response.next_page.is_some();
                let records = response.into_results()?;
                Ok(PageResult {
                    media_ids: sources.media.add_media_infos(records),
                    has_more,
                })
            }
        }
    }
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn with_page_param(params: &[(String, String)], page: u32) -> Vec<(String, String)> {
    let mut params = params.to_vec();
    params.push(("p".to_string(), page.to_string()));
    params
}

/// Find links to works in an HTML page, in order, without duplicates.
pub fn scrape_work_ids(html: &str) -> Vec<MediaId> {
    const MARKER: &str = "/artworks/";

    let mut seen = HashSet::new();
    let mut media_ids = Vec::new();
    for (index, _) in html.match_indices(MARKER) {
        let rest = &html[index + MARKER.len()..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            continue;
        }
        let id = &rest[..digits];
        if seen.insert(id) {
            media_ids.push(MediaId::work(id));
        }
    }
    media_ids
}

/// Pull the thumbnail list and the more-pages hint out of a search-style response.
///
/// Responses put the list under "works", under "illustManga.data" or under
/// "thumbnails.illust", and say whether there are more pages with either "lastPage" or
/// "isLastPage".
fn search_results(body: Value, page: u32) -> (Vec<Value>, bool) {
    let container = match &body {
        Value::Object(map) => map
            .get("illustManga")
            .or_else(|| map.get("page"))
            .unwrap_or(&body),
        _ => &body,
    };

    let has_more = match (
        container.get("lastPage").and_then(Value::as_u64),
        container.get("isLastPage").and_then(Value::as_bool),
    ) {
        (Some(last_page), _) => u64::from(page) < last_page,
        (None, Some(is_last)) => !is_last,
        (None, None) => false,
    };

    let works = match body {
        Value::Array(list) => list,
        Value::Object(mut map) => {
            let nested = map
                .remove("illustManga")
                .and_then(|mut v| v.get_mut("data").map(Value::take))
                .or_else(|| {
                    map.remove("thumbnails")
                        .and_then(|mut v| v.get_mut("illust").map(Value::take))
                })
                .or_else(|| map.remove("works"));
            match nested {
                Some(Value::Array(list)) => list,
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    };
    (works, has_more)
}

/// IDs from a response that lists everything at once, newest first.
///
/// The response is either a list of IDs or an object of ID maps, like
/// `{"illusts": {"12": null}, "manga": {"15": null}}`.
fn prefetched_ids(body: &Value) -> Vec<MediaId> {
    let mut ids: Vec<u64> = match body {
        Value::Array(list) => list
            .iter()
            .filter_map(|id| match id {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            })
            .collect(),
        Value::Object(map) => map
            .values()
            .filter_map(Value::as_object)
            .flat_map(|ids| ids.keys())
            .filter_map(|id| id.parse().ok())
            .collect(),
        _ => Vec::new(),
    };

    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.dedup();
    ids.into_iter()
        .map(|id| MediaId::work(id.to_string()))
        .collect()
}
