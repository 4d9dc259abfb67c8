use futures::future::{self, FutureExt};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::api::{ApiClient, ApiResponse, LocalApi};
use super::coalescer::{LoadKind, LoadResult, RequestCoalescer, SharedLoad};
use super::extra_data::{ExtraDataStore, is_empty_edit, merge_edits};
use super::media_id::MediaId;
use super::media_info::{
    ExtraImageData, IllustDetail, MangaPage, MediaInfo, ThumbnailData, UgoiraMetadata, WorkType,
    check_record_keys,
};
use super::media_store::{MediaEvent, MediaStore, Notify};
use super::user_cache::UserCache;
use crate::config::{HostRewrite, Settings};
use crate::error::ExtraDataError;

/// Which completeness a caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoOptions {
    pub full: bool,
    /// When asking for partial info, hide full-only fields even if they're loaded.
    pub safe: bool,
}

impl InfoOptions {
    pub const FULL: InfoOptions = InfoOptions {
        full: true,
        safe: true,
    };

    pub const PARTIAL: InfoOptions = InfoOptions {
        full: false,
        safe: true,
    };

    /// Return full records as-is to partial requests, for callers that can use the extra fields.
    pub fn allow_extra_fields(self) -> Self {
        InfoOptions {
            safe: false,
            ..self
        }
    }
}

impl Default for InfoOptions {
    fn default() -> Self {
        InfoOptions::FULL
    }
}

struct MediaCacheInner {
    store: MediaStore,
    loads: RequestCoalescer,
    api: Arc<dyn ApiClient>,
    local_api: Option<Arc<dyn LocalApi>>,
    extra_data: Arc<dyn ExtraDataStore>,
    users: Arc<UserCache>,
    rewrites: Vec<HostRewrite>,
    batch_size: usize,
}

/// Info about every work the session has seen, loaded on demand.
///
/// Concurrent requests for the same work share one request, works that failed to load
/// are remembered so they aren't requested again, and full info is never replaced by
/// partial info.
#[derive(Clone)]
pub struct MediaCache {
    inner: Arc<MediaCacheInner>,
}

impl MediaCache {
    pub fn new(
        settings: &Settings,
        api: Arc<dyn ApiClient>,
        local_api: Option<Arc<dyn LocalApi>>,
        extra_data: Arc<dyn ExtraDataStore>,
        users: Arc<UserCache>,
    ) -> Self {
        MediaCache {
            inner: Arc::new(MediaCacheInner {
                store: MediaStore::new(),
                loads: RequestCoalescer::new(),
                api,
                local_api,
                extra_data,
                users,
                rewrites: settings.image_host_rewrites.clone(),
                batch_size: settings.batch_size.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MediaEvent> {
        self.inner.store.subscribe()
    }

    pub fn users(&self) -> &UserCache {
        &self.inner.users
    }

    /// Get info for a work, loading it if needed. Returns None if the work doesn't exist
    /// or couldn't be loaded.
    pub async fn get_media_info(&self, media_id: &MediaId, options: InfoOptions) -> LoadResult {
        let media_id = media_id.first_page();
        if self.inner.store.is_nonexistent(&media_id) {
            return None;
        }

        if let Some(info) = self.get_media_info_sync(&media_id, options) {
            return Some(info);
        }

        if options.full {
            let info = self.start_full_load(&media_id, None).await?;
            return self.resolve(info, options);
        }

        match self.inner.loads.find_satisfying(&media_id, LoadKind::Partial) {
            Some(load) => {
                let _ = load.await;
            }
            None => {
                self.batch_get_media_info_partial(std::slice::from_ref(&media_id))
                    .await
            }
        }
        self.get_media_info_sync(&media_id, options)
    }

    /// Get info that's already loaded, without making any requests.
    pub fn get_media_info_sync(&self, media_id: &MediaId, options: InfoOptions) -> LoadResult {
        let media_id = media_id.first_page();
        if self.inner.store.is_nonexistent(&media_id) {
            return None;
        }
        let info = self.inner.store.get(&media_id)?;
        self.resolve(info, options)
    }

    fn resolve(&self, info: Arc<MediaInfo>, options: InfoOptions) -> LoadResult {
        if options.full && !info.full {
            return None;
        }
        if !options.full && info.full && options.safe {
            return Some(Arc::new(info.to_partial()));
        }
        Some(info)
    }

    /// The reason a work couldn't be loaded, if it failed.
    pub fn get_media_load_error(&self, media_id: &MediaId) -> Option<String> {
        self.inner.store.nonexistent_reason(&media_id.first_page())
    }

    /// Reload full info for a work, ignoring what's cached and any earlier failure.
    pub async fn refresh_media_info(&self, media_id: &MediaId) -> LoadResult {
        let media_id = media_id.first_page();
        self.inner.store.clear_nonexistent(&media_id);
        self.start_full_load(&media_id, None).await
    }

    /// Add full info that was loaded elsewhere, such as data embedded in a page.
    ///
    /// If `preprocessed` is set, `record` is already in our format and is stored as-is.
    /// Otherwise it's a raw detail response, which goes through the same loading as a
    /// fresh request, without requesting the detail again.
    pub async fn add_media_info_full(&self, record: Value, preprocessed: bool) -> LoadResult {
        if preprocessed {
            let info = self.ingest_record(record, Notify::Single)?;
            if !info.full {
                log::warn!("add_media_info_full got partial info for {}", info.media_id);
            }
            return Some(info);
        }

        let id = match record.get("illustId") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                log::warn!("add_media_info_full: record has no illustId");
                return None;
            }
        };
        let media_id = match MediaId::parse_work(&id) {
            Ok(media_id) => media_id,
            Err(e) => {
                log::warn!("add_media_info_full: {e}");
                return None;
            }
        };
        self.start_full_load(&media_id, Some(record)).await
    }

    /// Load full info for each ID concurrently.
    pub async fn batch_get_media_info_full(&self, media_ids: &[MediaId]) -> Vec<LoadResult> {
        future::join_all(
            media_ids
                .iter()
                .map(|media_id| self.get_media_info(media_id, InfoOptions::FULL)),
        )
        .await
    }

    /// Make sure at least partial info is loaded for each ID.
    ///
    /// IDs that are already loaded are skipped, IDs already loading are waited on, and the
    /// rest are requested in as few batch requests as possible. IDs missing from a batch
    /// response are marked as nonexistent.
    pub async fn batch_get_media_info_partial(&self, media_ids: &[MediaId]) {
        let mut waits: Vec<SharedLoad> = Vec::new();
        let mut remote = Vec::new();
        let mut local = Vec::new();
        let mut seen = HashSet::new();

        for media_id in media_ids {
            let media_id = media_id.first_page();
            if !seen.insert(media_id.clone()) {
                continue;
            }
            if self.inner.store.has(&media_id) || self.inner.store.is_nonexistent(&media_id) {
                continue;
            }
            if let Some(load) = self.inner.loads.find_satisfying(&media_id, LoadKind::Partial) {
                waits.push(load);
                continue;
            }

            if media_id.is_local() {
                local.push(media_id);
            } else {
                remote.push(media_id);
            }
        }

        for chunk in remote.chunks(self.inner.batch_size) {
            waits.extend(self.start_partial_batch(chunk.to_vec(), false));
        }
        for chunk in local.chunks(self.inner.batch_size) {
            waits.extend(self.start_partial_batch(chunk.to_vec(), true));
        }

        future::join_all(waits).await;
    }

    fn start_partial_batch(&self, media_ids: Vec<MediaId>, local: bool) -> Vec<SharedLoad> {
        let this = self.clone();
        let batch_ids = media_ids.clone();
        let batch = async move {
            if local {
                this.load_local_partial_batch(batch_ids).await;
            } else {
                this.load_remote_partial_batch(batch_ids).await;
            }
        }
        .boxed()
        .shared();

        media_ids
            .iter()
            .map(|media_id| {
                let batch = batch.clone();
                let store_lookup = self.clone();
                let lookup_id = media_id.clone();
                self.inner.loads.get_or_start(media_id, LoadKind::Partial, move || {
                    async move {
                        batch.await;
                        store_lookup.inner.store.get(&lookup_id)
                    }
                    .boxed()
                })
            })
            .collect()
    }

    async fn load_remote_partial_batch(&self, media_ids: Vec<MediaId>) {
        let params: Vec<(String, String)> = media_ids
            .iter()
            .map(|media_id| ("ids[]".to_string(), media_id.id().to_string()))
            .collect();

        match self
            .inner
            .api
            .get("/ajax/illust/thumbnails", &params)
            .await
            .into_body()
        {
            Ok(body) => {
                self.add_media_infos_partial(thumbnail_list(body)).await;
            }
            Err(message) => {
                log::warn!("Batch load of {} works failed: {message}", media_ids.len());
                for media_id in &media_ids {
                    self.inner.store.mark_nonexistent(media_id.clone(), message.clone());
                }
                return;
            }
        }

        self.mark_missing(&media_ids);
    }

    async fn load_local_partial_batch(&self, media_ids: Vec<MediaId>) {
        let Some(local_api) = self.inner.local_api.clone() else {
            for media_id in media_ids {
                self.inner
                    .store
                    .mark_nonexistent(media_id, "Local files aren't available");
            }
            return;
        };

        let ids: Vec<String> = media_ids.iter().map(MediaId::to_string).collect();
        match local_api
            .request("/api/illusts", json!({ "ids": ids }))
            .await
            .into_results()
        {
            Ok(results) => {
                self.add_media_infos(results);
            }
            Err(reason) => {
                for media_id in &media_ids {
                    self.inner.store.mark_nonexistent(media_id.clone(), reason.clone());
                }
                return;
            }
        }

        self.mark_missing(&media_ids);
    }

    fn mark_missing(&self, media_ids: &[MediaId]) {
        for media_id in media_ids {
            if !self.inner.store.has(media_id) && !self.inner.store.is_nonexistent(media_id) {
                self.inner
                    .store
                    .mark_nonexistent(media_id.clone(), "Work does not exist");
            }
        }
    }

    /// Add partial info from search results or batch responses.
    ///
    /// Saved edits are loaded for the whole batch before anything is stored. Works that
    /// already have full info keep it. Returns the IDs that were stored.
    pub async fn add_media_infos_partial(&self, thumbnails: Vec<Value>) -> Vec<MediaId> {
        let mut infos = Vec::new();
        for thumbnail in thumbnails {
            let thumbnail: ThumbnailData = match serde_json::from_value(thumbnail) {
                Ok(thumbnail) => thumbnail,
                Err(e) => {
                    log::warn!("Skipping malformed thumbnail data: {e}");
                    continue;
                }
            };

            if let Some(avatar) = &thumbnail.profile_image_url {
                self.inner.users.add_avatar(&thumbnail.user_id, avatar);
            }

            let Some(info) = thumbnail.into_media_info(&self.inner.rewrites) else {
                log::warn!("Skipping thumbnail data with an invalid ID");
                continue;
            };
            infos.push(info);
        }

        let works: Vec<MediaId> = infos.iter().map(|info| info.media_id.clone()).collect();
        let mut edits = self.load_edits(&works).await;

        infos
            .into_iter()
            .map(|mut info| {
                if let Some(extra_data) = edits.remove(&info.media_id) {
                    info.extra_data = extra_data;
                }
                let media_id = info.media_id.clone();
                self.inner.store.clear_nonexistent(&media_id);
                self.inner.store.set(info, Notify::Bulk);
                media_id
            })
            .collect()
    }

    async fn load_edits(&self, works: &[MediaId]) -> HashMap<MediaId, BTreeMap<MediaId, ExtraImageData>> {
        if works.is_empty() {
            return HashMap::new();
        }
        match self.inner.extra_data.load_for_works(works).await {
            Ok(edits) => edits,
            Err(e) => {
                log::warn!("Couldn't load edits for {} works: {e}", works.len());
                HashMap::new()
            }
        }
    }

    /// Add records that are already in our format, such as local file listings. These carry
    /// their own edit overlay. Returns the IDs that were stored.
    pub fn add_media_infos(&self, records: Vec<Value>) -> Vec<MediaId> {
        records
            .into_iter()
            .filter_map(|record| self.ingest_record(record, Notify::Bulk))
            .map(|info| info.media_id.clone())
            .collect()
    }

    /// Store a record that's already in our format, checking it against the schema.
    fn ingest_record(&self, record: Value, notify: Notify) -> LoadResult {
        let full = record.get("full").and_then(Value::as_bool).unwrap_or(false);
        if let Value::Object(map) = &record {
            check_record_keys(map, full);
        }

        let mut info: MediaInfo = match serde_json::from_value(record) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Ignoring media info that doesn't match the schema: {e}");
                return None;
            }
        };

        if info.full && info.details.is_none() {
            log::warn!("{} claims to be full but has no full fields", info.media_id);
            info.full = false;
        }

        info.media_id = info.media_id.first_page();
        self.inner.store.clear_nonexistent(&info.media_id);
        Some(self.inner.store.set(info, notify))
    }

    /// Patch fields of a loaded record. Fields that aren't legal for the record's
    /// completeness are skipped.
    pub fn update_media_info(&self, media_id: &MediaId, fields: &Map<String, Value>) -> LoadResult {
        let media_id = media_id.first_page();
        if !self.inner.store.has(&media_id) {
            log::warn!("update_media_info: {media_id} isn't loaded");
            return None;
        }

        self.inner.store.modify(&media_id, |info| match info.patched(fields) {
            Ok(patched) => Some(patched),
            Err(e) => {
                log::warn!("Invalid update for {media_id}: {e}");
                None
            }
        })
    }

    /// Merge `edits` into the saved edits for one page, returning the merged edits.
    ///
    /// The loaded record is updated before the edits are written out, and loads that finish
    /// later keep the change. If only bookkeeping is left after merging, the saved edits
    /// are deleted.
    pub async fn save_extra_image_data(
        &self,
        media_id: &MediaId,
        edits: &ExtraImageData,
    ) -> Result<ExtraImageData, ExtraDataError> {
        let existing = self.inner.extra_data.load(media_id).await?;
        let data = merge_edits(media_id, existing, edits);
        let empty = is_empty_edit(&data);

        let edit = if empty { None } else { Some(data.clone()) };
        self.inner.store.save_edit(media_id, edit);

        if empty {
            self.inner.extra_data.delete(media_id).await?;
        } else {
            self.inner.extra_data.save(media_id, &data).await?;
        }
        Ok(data)
    }

    fn start_full_load(&self, media_id: &MediaId, base: Option<Value>) -> SharedLoad {
        let this = self.clone();
        let load_id = media_id.clone();
        self.inner.loads.get_or_start(media_id, LoadKind::Full, move || {
            async move { this.load_media_info(load_id, base).await }.boxed()
        })
    }

    fn spawn_request(&self, path: String) -> JoinHandle<ApiResponse> {
        let api = Arc::clone(&self.inner.api);
        tokio::spawn(async move { api.get(&path, &[]).await })
    }

    async fn load_media_info(&self, media_id: MediaId, base: Option<Value>) -> LoadResult {
        if media_id.is_local() {
            return self.load_local_media_info(media_id).await;
        }

        self.inner.store.clear_nonexistent(&media_id);
        let work_id = media_id.id().to_string();
        let pages_path = format!("/ajax/illust/{work_id}/pages");
        let ugoira_path = format!("/ajax/illust/{work_id}/ugoira_meta");

        // If partial info already tells us what else to load, start it alongside the detail request.
        let mut pages_load = None;
        let mut ugoira_load = None;
        if let Some(known) = self.inner.store.get(&media_id) {
            if known.page_count > 1 {
                pages_load = Some(self.spawn_request(pages_path.clone()));
            }
            if known.illust_type == WorkType::Animation {
                ugoira_load = Some(self.spawn_request(ugoira_path.clone()));
            }
        }

        let body = match base {
            Some(body) => body,
            None => {
                let response = self
                    .inner
                    .api
                    .get(&format!("/ajax/illust/{work_id}"), &[])
                    .await;
                match response.into_body() {
                    Ok(body) => body,
                    Err(message) => {
                        self.inner.store.mark_nonexistent(media_id, message);
                        return None;
                    }
                }
            }
        };

        let detail: IllustDetail = match serde_json::from_value(body) {
            Ok(detail) => detail,
            Err(e) => {
                log::warn!("Invalid detail response for {media_id}: {e}");
                self.inner
                    .store
                    .mark_nonexistent(media_id, format!("Invalid response: {e}"));
                return None;
            }
        };

        // Edits saved while this load runs are applied again when the record is stored.
        let extra_data = match self.inner.extra_data.load_for_work(&media_id).await {
            Ok(extra_data) => extra_data,
            Err(e) => {
                log::warn!("Couldn't load edits for {media_id}: {e}");
                Default::default()
            }
        };

        let page_count = detail.page_count;
        let is_animation = detail.work_type() == WorkType::Animation;
        if pages_load.is_none() && page_count > 1 {
            pages_load = Some(self.spawn_request(pages_path));
        }
        if ugoira_load.is_none() && is_animation {
            ugoira_load = Some(self.spawn_request(ugoira_path));
        }

        if let Some(avatar) = detail.author_avatar() {
            self.inner.users.add_avatar(&detail.user_id, avatar);
        }

        let rewrites = &self.inner.rewrites;
        let mut info = detail.into_media_info(media_id.clone(), rewrites);
        info.extra_data = extra_data;

        let pages = match pages_load {
            Some(load) => {
                let pages = secondary_result::<Vec<MangaPage>>(load).await;
                match pages {
                    // A stale partial record may have started this for a single-page work.
                    Ok(_) if page_count <= 1 => None,
                    Ok(pages) => Some(pages),
                    Err(message) => {
                        self.inner.store.mark_nonexistent(media_id, message);
                        return None;
                    }
                }
            }
            None => None,
        };

        if let Some(load) = ugoira_load {
            match secondary_result::<UgoiraMetadata>(load).await {
                Ok(_) if !is_animation => {}
                Ok(metadata) => info.set_ugoira_metadata(metadata, rewrites),
                Err(message) => {
                    self.inner.store.mark_nonexistent(media_id, message);
                    return None;
                }
            }
        }

        info.set_manga_pages(pages, rewrites);
        info.full = true;
        Some(self.inner.store.set(info, Notify::Single))
    }

    async fn load_local_media_info(&self, media_id: MediaId) -> LoadResult {
        let Some(local_api) = self.inner.local_api.clone() else {
            self.inner
                .store
                .mark_nonexistent(media_id, "Local files aren't available");
            return None;
        };

        self.inner.store.clear_nonexistent(&media_id);
        let response = local_api
            .request("/api/illust", json!({ "id": media_id.to_string() }))
            .await;

        let record = match response.into_results() {
            Ok(results) => results.into_iter().next(),
            Err(reason) => {
                self.inner.store.mark_nonexistent(media_id, reason);
                return None;
            }
        };

        let Some(record) = record else {
            self.inner
                .store
                .mark_nonexistent(media_id, "File does not exist");
            return None;
        };

        let info = self.ingest_record(record, Notify::Single)?;
        if !info.full {
            log::warn!("Local API returned partial info for {media_id}");
            return None;
        }
        Some(info)
    }
}

async fn secondary_result<T: serde::de::DeserializeOwned>(
    load: JoinHandle<ApiResponse>,
) -> Result<T, String> {
    let response = load.await.map_err(|e| format!("Request failed: {e}"))?;
    let body = response.into_body()?;
    serde_json::from_value(body).map_err(|e| format!("Invalid response: {e}"))
}

/// Batch and search responses give works either as a bare list or under "works".
pub(crate) fn thumbnail_list(body: Value) -> Vec<Value> {
    match body {
        Value::Array(list) => list,
        Value::Object(mut map) => match map.remove("works") {
            Some(Value::Array(list)) => list,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
