//! Scripted collaborators and record builders shared by the unit tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::backend::api::{ApiClient, ApiResponse, LocalApi, LocalResponse, with_query};
use crate::backend::extra_data::{ExtraDataStore, MemoryExtraDataStore};
use crate::backend::media_cache::MediaCache;
use crate::backend::media_id::MediaId;
use crate::backend::media_info::{
    ExtraImageData, FullDetails, ImageUrls, MangaPage, MediaInfo, WorkType,
};
use crate::backend::user_cache::UserCache;
use crate::config::{BackoffSettings, Settings};
use crate::error::ExtraDataError;

#[derive(Default)]
struct MockApiState {
    routes: Mutex<HashMap<String, ApiResponse>>,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    delay_ms: AtomicU64,
}

/// An API that answers from a route table and counts calls. Routes may include a query
/// string, which is matched before the bare path.
#[derive(Clone, Default)]
pub struct MockApi {
    state: Arc<MockApiState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay_ms(self, ms: u64) -> Self {
        self.state.delay_ms.store(ms, Ordering::SeqCst);
        self
    }

    pub fn route(&self, path: &str, body: Value) {
        self.set_route(path, ApiResponse::ok(body));
    }

    /// Answer requests to `path` whose `p` param is `page`, whatever the other params are.
    pub fn route_page(&self, path: &str, page: u32, body: Value) {
        self.set_route(&page_key(path, &page.to_string()), ApiResponse::ok(body));
    }

    pub fn route_error(&self, path: &str, message: &str) {
        self.set_route(path, ApiResponse::failure(message));
    }

    pub fn route_html(&self, path: &str, html: &str) {
        self.set_route(path, ApiResponse::ok(Value::String(html.to_string())));
    }

    fn set_route(&self, path: &str, response: ApiResponse) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, params)| called == path || with_query(called, params) == path)
            .count()
    }

    pub fn calls_to_page(&self, path: &str, page: u32) -> usize {
        let page = page.to_string();
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, params)| called == path && page_param(params) == Some(page.as_str()))
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.calls.lock().unwrap().len()
    }

    pub fn reset_calls(&self) {
        self.state.calls.lock().unwrap().clear();
    }

    pub fn call_log(&self) -> Vec<String> {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(path, params)| with_query(path, params))
            .collect()
    }

    /// The params of the first call to `path`.
    pub fn params_of(&self, path: &str) -> Vec<(String, String)> {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .find(|(called, _)| called == path)
            .map(|(_, params)| params.clone())
            .unwrap_or_default()
    }

    async fn respond(&self, path: &str, params: &[(String, String)]) -> ApiResponse {
        self.state
            .calls
            .lock()
            .unwrap()
            .push((path.to_string(), params.to_vec()));

        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let routes = self.state.routes.lock().unwrap();
        let by_page = page_param(params).and_then(|page| routes.get(&page_key(path, page)));
        routes
            .get(&with_query(path, params))
            .or(by_page)
            .or_else(|| routes.get(path))
            .cloned()
            .unwrap_or_else(|| ApiResponse::failure(format!("No route for {path}")))
    }
}

fn page_key(path: &str, page: &str) -> String {
    format!("{path} page {page}")
}

fn page_param(params: &[(String, String)]) -> Option<&str> {
    params
        .iter()
        .find(|(key, _)| key == "p")
        .map(|(_, value)| value.as_str())
}

#[async_trait]
impl ApiClient for MockApi {
    async fn get(&self, path: &str, params: &[(String, String)]) -> ApiResponse {
        self.respond(path, params).await
    }

    async fn get_html(&self, path: &str, params: &[(String, String)]) -> ApiResponse {
        self.respond(path, params).await
    }
}

#[derive(Default)]
struct MockLocalState {
    routes: Mutex<HashMap<String, LocalResponse>>,
    calls: Mutex<Vec<(String, Value)>>,
}

#[derive(Clone, Default)]
pub struct MockLocalApi {
    state: Arc<MockLocalState>,
}

impl MockLocalApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, path: &str, results: Vec<Value>) {
        self.route_response(
            path,
            LocalResponse {
                success: true,
                results,
                ..Default::default()
            },
        );
    }

    pub fn route_response(&self, path: &str, response: LocalResponse) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, _)| called == path)
            .count()
    }
}

#[async_trait]
impl LocalApi for MockLocalApi {
    async fn request(&self, path: &str, args: Value) -> LocalResponse {
        self.state
            .calls
            .lock()
            .unwrap()
            .push((path.to_string(), args));
        tokio::task::yield_now().await;

        self.state
            .routes
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_else(|| LocalResponse::failure(format!("No route for {path}")))
    }
}

/// An in-memory edit store whose first save waits until the returned sender fires.
pub struct GatedExtraDataStore {
    entries: MemoryExtraDataStore,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl GatedExtraDataStore {
    pub fn new() -> (Self, oneshot::Sender<()>) {
        let (release, gate) = oneshot::channel();
        let store = GatedExtraDataStore {
            entries: MemoryExtraDataStore::new(),
            gate: Mutex::new(Some(gate)),
        };
        (store, release)
    }
}

#[async_trait]
impl ExtraDataStore for GatedExtraDataStore {
    async fn load(&self, media_id: &MediaId) -> Result<Option<ExtraImageData>, ExtraDataError> {
        self.entries.load(media_id).await
    }

    async fn save(&self, media_id: &MediaId, data: &ExtraImageData) -> Result<(), ExtraDataError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.await.ok();
        }
        self.entries.save(media_id, data).await
    }

    async fn delete(&self, media_id: &MediaId) -> Result<(), ExtraDataError> {
        self.entries.delete(media_id).await
    }

    async fn load_for_works(
        &self,
        works: &[MediaId],
    ) -> Result<HashMap<MediaId, BTreeMap<MediaId, ExtraImageData>>, ExtraDataError> {
        self.entries.load_for_works(works).await
    }
}

pub fn test_settings() -> Settings {
    Settings {
        backoff: BackoffSettings {
            initial_ms: 1,
            exponent: 1.5,
            max_ms: 10,
            cooldown_ms: 60_000,
        },
        ..Settings::default()
    }
}

pub fn test_cache(api: MockApi) -> MediaCache {
    MediaCache::new(
        &test_settings(),
        Arc::new(api),
        None,
        Arc::new(MemoryExtraDataStore::new()),
        Arc::new(UserCache::new()),
    )
}

pub fn test_cache_with_edits(api: MockApi, extra_data: Arc<dyn ExtraDataStore>) -> MediaCache {
    MediaCache::new(
        &test_settings(),
        Arc::new(api),
        None,
        extra_data,
        Arc::new(UserCache::new()),
    )
}

pub fn test_cache_with_local(api: MockApi, local: MockLocalApi) -> MediaCache {
    MediaCache::new(
        &test_settings(),
        Arc::new(api),
        Some(Arc::new(local)),
        Arc::new(MemoryExtraDataStore::new()),
        Arc::new(UserCache::new()),
    )
}

pub fn partial_info(media_id: &str, page_count: u32) -> MediaInfo {
    let media_id: MediaId = media_id.parse().unwrap();
    MediaInfo {
        media_id: media_id.clone(),
        full: false,
        illust_type: if page_count > 1 {
            WorkType::Manga
        } else {
            WorkType::Illustration
        },
        illust_title: format!("Title of {media_id}"),
        user_id: "100".to_string(),
        user_name: "artist".to_string(),
        page_count,
        width: 1000,
        height: 800,
        preview_urls: vec![format!("https://example.com/{}.jpg", media_id.id())],
        bookmark_data: None,
        create_date: "2024-05-01T12:00:00+09:00".to_string(),
        tag_list: vec!["tag".to_string()],
        ai_generated: false,
        extra_data: BTreeMap::new(),
        details: None,
    }
}

pub fn full_info(media_id: &str, page_count: u32) -> MediaInfo {
    let mut info = partial_info(media_id, page_count);
    let pages = (0..page_count)
        .map(|page| MangaPage {
            width: 1000,
            height: 800,
            urls: ImageUrls {
                original: format!("https://example.com/{}_p{page}.png", info.media_id.id()),
                ..Default::default()
            },
        })
        .collect();
    info.full = true;
    info.details = Some(FullDetails {
        description: String::new(),
        like_count: 0,
        bookmark_count: 0,
        view_count: 0,
        urls: ImageUrls::default(),
        manga_pages: pages,
        ugoira_metadata: None,
    });
    info
}

/// A search listing entry for work `id`.
pub fn thumbnail_json(id: &str, page_count: u32) -> Value {
    json!({
        "id": id,
        "title": format!("Work {id}"),
        "illustType": if page_count > 1 { 1 } else { 0 },
        "userId": "100",
        "userName": "artist",
        "pageCount": page_count,
        "width": 1000,
        "height": 800,
        "url": format!("https://i.pximg.net/c/250x250/{id}_p0.jpg"),
        "bookmarkData": null,
        "createDate": "2024-05-01T12:00:00+09:00",
        "tags": ["tag"],
        "aiType": 1
    })
}

/// A detail response body for work `id`.
pub fn detail_json(id: &str, page_count: u32, illust_type: u32) -> Value {
    json!({
        "illustId": id,
        "illustTitle": format!("Work {id}"),
        "illustType": illust_type,
        "userId": "100",
        "userName": "artist",
        "pageCount": page_count,
        "width": 1000,
        "height": 800,
        "urls": {
            "mini": format!("https://i.pximg.net/mini/{id}.jpg"),
            "small": format!("https://i.pximg.net/small/{id}.jpg"),
            "original": format!("https://i.pximg.net/original/{id}.png")
        },
        "tags": {"tags": [{"tag": "tag"}, {"tag": "other"}]},
        "bookmarkData": null,
        "createDate": "2024-05-01T12:00:00+09:00",
        "aiType": 1,
        "description": "",
        "likeCount": 3,
        "bookmarkCount": 2,
        "viewCount": 10,
        "userIllusts": {
            id: null,
            "1": {"profileImageUrl": "https://i.pximg.net/avatar.png"}
        }
    })
}

/// The sorted top-level keys of a record as serialized.
pub fn key_set(info: &MediaInfo) -> Vec<String> {
    let Value::Object(map) = serde_json::to_value(info).unwrap() else {
        panic!("record didn't serialize to an object");
    };
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}
