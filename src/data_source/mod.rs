pub mod backoff;
pub mod id_list;
pub mod provider;
pub mod registry;
pub mod url_state;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

use crate::backend::media_cache::InfoOptions;
use crate::backend::media_id::MediaId;
use crate::config::Settings;
use crate::events::Subscribers;
use crate::sync::lock;
use backoff::EmptyPageBackoff;

pub use id_list::{IdList, MangaMode};
pub use provider::{PageProvider, PageResult, SourceInfo, Sources};
pub use registry::DataSourceRegistry;
pub use url_state::UrlState;

type PageLoad = Shared<BoxFuture<'static, bool>>;

/// Why a page is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadCause {
    /// The first page shown for a URL.
    Initial,
    /// Navigating forward past the loaded data.
    Next,
    /// Loading results before the first loaded page. This may skip pages.
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSourceEvent {
    PageAdded(u32),
    /// Something other than the ID list changed, like the end of the results being found.
    Updated,
}

struct State {
    id_list: IdList,
    loading_pages: HashMap<u32, PageLoad>,
    /// Pages whose load finished. Failed loads aren't recorded, so they can be retried.
    loaded_pages: HashMap<u32, bool>,
    first_empty_page: Option<u32>,
    initial_page: u32,
    lifecycle: Lifecycle,
    backoff: EmptyPageBackoff,
    /// The latest navigation state, used to keep the viewed media in the results.
    url_state: UrlState,
}

/// One listing's results, loaded a page at a time as navigation reaches the end of what's
/// loaded.
pub struct DataSource {
    url: UrlState,
    canonical_url: String,
    info: SourceInfo,
    provider: PageProvider,
    sources: Sources,
    state: Mutex<State>,
    events: Subscribers<DataSourceEvent>,
}

impl DataSource {
    pub fn new(url: UrlState, sources: Sources, settings: &Settings) -> Arc<Self> {
        let (provider, info) = PageProvider::for_url(&url, settings);
        Self::with_provider(url, provider, info, sources, settings)
    }

    pub fn with_provider(
        url: UrlState,
        provider: PageProvider,
        info: SourceInfo,
        sources: Sources,
        settings: &Settings,
    ) -> Arc<Self> {
        let initial_page = url.page().unwrap_or(1);
        log::debug!("Creating {} data source for {url} at page {initial_page}", info.name);

        Arc::new(DataSource {
            canonical_url: url.canonical(),
            info,
            provider,
            sources,
            state: Mutex::new(State {
                id_list: IdList::new(),
                loading_pages: HashMap::new(),
                loaded_pages: HashMap::new(),
                first_empty_page: None,
                initial_page,
                lifecycle: Lifecycle::Constructed,
                backoff: EmptyPageBackoff::new(settings.backoff.clone()),
                url_state: url.clone(),
            }),
            events: Subscribers::new(),
            url,
        })
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn is_transient(&self) -> bool {
        self.info.transient
    }

    pub fn includes_manga_pages(&self) -> bool {
        self.info.includes_manga_pages
    }

    pub fn url(&self) -> &UrlState {
        &self.url
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    pub fn initial_page(&self) -> u32 {
        lock(&self.state).initial_page
    }

    /// The first page known to be past the end of the results.
    pub fn first_empty_page(&self) -> Option<u32> {
        lock(&self.state).first_empty_page
    }

    pub fn lifecycle(&self) -> Lifecycle {
        lock(&self.state).lifecycle
    }

    /// A snapshot of the loaded IDs.
    pub fn id_list(&self) -> IdList {
        lock(&self.state).id_list.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DataSourceEvent> {
        self.events.subscribe()
    }

    pub fn startup(&self) {
        let mut state = lock(&self.state);
        if state.lifecycle != Lifecycle::Started {
            log::debug!("Starting {} data source", self.info.name);
            state.lifecycle = Lifecycle::Started;
        }
    }

    /// Stop acting on results. Loads already running finish and store what they got, but
    /// don't send events or continue on to other pages.
    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        if state.lifecycle == Lifecycle::Started {
            log::debug!("Stopping {} data source", self.info.name);
        }
        state.lifecycle = Lifecycle::Stopped;
    }

    fn emit(&self, event: DataSourceEvent) {
        if self.lifecycle() != Lifecycle::Stopped {
            self.events.emit(event);
        }
    }

    /// Record the latest navigation state.
    pub fn set_url_state(&self, url_state: UrlState) {
        lock(&self.state).url_state = url_state;
    }

    pub fn current_media_id(&self, url_state: &UrlState) -> Option<MediaId> {
        url_state.media_id()
    }

    /// The navigation state for viewing `media_id`, with the start page pointing at the
    /// page it's on so reloading the URL shows the same results.
    pub fn set_current_media_id(&self, url_state: &UrlState, media_id: Option<&MediaId>) -> UrlState {
        let page = media_id.and_then(|media_id| {
            lock(&self.state)
                .id_list
                .page_for_media_id(media_id)
                .map(|(page, _)| page)
        });

        let url_state = url_state.with_media_id(media_id);
        match page {
            Some(page) => url_state.with_page(page),
            None => url_state,
        }
    }

    /// Whether `page` may be loaded through normal navigation: anything before any page is
    /// loaded, then only pages adjoining the loaded range.
    pub fn can_load_page(&self, page: u32) -> bool {
        can_load_page(&lock(&self.state).id_list, page)
    }

    pub fn is_page_loaded(&self, page: u32) -> bool {
        lock(&self.state).id_list.is_page_loaded(page)
    }

    /// Load a page of results. Returns false if the page can't be loaded: it's before page
    /// 1, past the end of the results, not adjacent to what's loaded, or the request failed.
    ///
    /// Concurrent calls for the same page share one load.
    pub async fn load_page(self: &Arc<Self>, page: u32, cause: LoadCause) -> bool {
        self.start_page_load(page, cause).await
    }

    fn start_page_load(self: &Arc<Self>, page: u32, cause: LoadCause) -> PageLoad {
        let finished = |result: bool| future::ready(result).boxed().shared();
        if page < 1 {
            log::warn!("Invalid page {page}");
            return finished(false);
        }

        let mut state = lock(&self.state);
        if let Some(&result) = state.loaded_pages.get(&page) {
            return finished(result);
        }
        if let Some(load) = state.loading_pages.get(&page) {
            return load.clone();
        }
        if state.first_empty_page.is_some_and(|empty| page >= empty) {
            return finished(false);
        }
        if cause != LoadCause::Previous && !can_load_page(&state.id_list, page) {
            log::warn!(
                "Not loading page {page}, which isn't next to the loaded pages {:?}..={:?}",
                state.id_list.lowest_loaded_page(),
                state.id_list.highest_loaded_page()
            );
            return finished(false);
        }

        let this = Arc::clone(self);
        let load = async move {
            // Let the caller finish registering this load before anything else can run.
            tokio::task::yield_now().await;
            this.load_page_internal(page, cause).await
        }
        .boxed()
        .shared();

        state.loading_pages.insert(page, load.clone());
        drop(state);

        tokio::spawn(load.clone());
        load
    }

    async fn load_page_internal(self: Arc<Self>, page: u32, cause: LoadCause) -> bool {
        log::debug!("Loading page {page} of {} ({cause:?})", self.info.name);
        let result = self.provider.load(page, &self.sources).await;

        let PageResult {
            mut media_ids,
            has_more,
        } = match result {
            Ok(result) => result,
            Err(message) => {
                log::warn!("Error loading page {page} of {}: {message}", self.info.name);
                lock(&self.state).loading_pages.remove(&page);
                return false;
            }
        };

        let (started, found_end, retry_delay) = {
            let mut state = lock(&self.state);
            state.loading_pages.remove(&page);

            if page == state.initial_page {
                if let Some(current) = self.current_media_id(&state.url_state) {
                    self.splice_current(&mut media_ids, current);
                }
            }

            let empty = media_ids.is_empty();
            state.id_list.add_page(page, media_ids);
            state.loaded_pages.insert(page, true);
            if page < state.initial_page {
                state.initial_page = page;
            }

            let mut found_end = false;
            let mut retry_delay = None;
            if empty && has_more {
                retry_delay = Some(state.backoff.next_delay(Instant::now()));
            } else if empty {
                found_end = state.first_empty_page.is_none_or(|known| page < known);
                if found_end {
                    state.first_empty_page = Some(page);
                }
            }
            (state.lifecycle == Lifecycle::Started, found_end, retry_delay)
        };

        self.emit(DataSourceEvent::PageAdded(page));
        if found_end {
            log::debug!("Reached the end of {} at page {page}", self.info.name);
            self.emit(DataSourceEvent::Updated);
        }

        // Some sources return empty pages in the middle of the results. Wait before moving on
        // so we don't hammer the API.
        if let Some(delay) = retry_delay {
            if started {
                log::info!(
                    "Page {page} of {} was empty, waiting {delay:?} before trying page {}",
                    self.info.name,
                    page + 1
                );
                tokio::time::sleep(delay).await;
                if self.lifecycle() == Lifecycle::Started {
                    self.start_page_load(page + 1, cause).await;
                }
            }
        }
        true
    }

    /// Make sure the media being viewed is in its page's results, so navigation can
    /// continue from it even if it moved to another page of the results.
    fn splice_current(&self, media_ids: &mut Vec<MediaId>, current: MediaId) {
        let present = media_ids.iter().any(|media_id| {
            if self.info.includes_manga_pages {
                *media_id == current
            } else {
                media_id.same_work(&current)
            }
        });
        if present {
            return;
        }

        let current = if self.info.includes_manga_pages {
            current
        } else {
            current.first_page()
        };
        log::debug!("Adding {current} to the start of its page");
        media_ids.insert(0, current);
    }

    /// Load the page before the first loaded page.
    pub async fn load_previous_page(self: &Arc<Self>) -> bool {
        let page = {
            let state = lock(&self.state);
            match state.id_list.lowest_loaded_page() {
                Some(lowest) => lowest.saturating_sub(1),
                None => state.initial_page.saturating_sub(1),
            }
        };
        if page < 1 {
            return false;
        }
        self.load_page(page, LoadCause::Previous).await
    }

    /// Return the media next to `from` in the loaded results, without loading anything.
    ///
    /// If the list has only the first page of multi-page works, normal mode steps through
    /// the work's pages before leaving it.
    pub fn get_neighboring_media_id(
        &self,
        from: Option<&MediaId>,
        forward: bool,
        mode: MangaMode,
    ) -> Option<MediaId> {
        if let Some(from) = from {
            if let Some(within) = self.step_within_work(from, forward, mode) {
                return Some(within);
            }
        }
        lock(&self.state)
            .id_list
            .get_neighboring_media_id(from, forward, mode)
    }

    fn step_within_work(&self, from: &MediaId, forward: bool, mode: MangaMode) -> Option<MediaId> {
        if mode != MangaMode::Normal || self.info.includes_manga_pages || from.is_local() {
            return None;
        }

        let info = self
            .sources
            .media
            .get_media_info_sync(from, InfoOptions::PARTIAL)?;
        let page = from.page();
        if forward && page + 1 < info.page_count {
            Some(from.with_page(page + 1))
        } else if !forward && page > 0 {
            Some(from.with_page(page - 1))
        } else {
            None
        }
    }

    /// Return the media next to `from`, loading another page if the loaded results run out.
    ///
    /// Returns None at the end of the results. With no `from`, returns the first result.
    pub async fn get_or_load_neighboring_media_id(
        self: &Arc<Self>,
        from: Option<&MediaId>,
        forward: bool,
        mode: MangaMode,
    ) -> Option<MediaId> {
        if let Some(media_id) = self.get_neighboring_media_id(from, forward, mode) {
            return Some(media_id);
        }

        let (page, cause) = {
            let state = lock(&self.state);
            let known_page = from.and_then(|from| state.id_list.page_for_media_id(from));
            let (mut page, cause) = match known_page {
                Some((page, _)) if forward => (page + 1, LoadCause::Next),
                Some((page, _)) if page <= 1 => return None,
                Some((page, _)) => (page - 1, LoadCause::Previous),
                None => (state.initial_page, LoadCause::Initial),
            };

            // Step over pages that are known to be empty.
            while state.id_list.page(page).is_some_and(|ids| ids.is_empty()) {
                if forward {
                    page += 1;
                } else if page <= 1 {
                    return None;
                } else {
                    page -= 1;
                }
            }

            if state.first_empty_page.is_some_and(|empty| page >= empty) {
                return None;
            }

            if state.id_list.is_page_loaded(page) {
                log::warn!(
                    "No neighbor found for {from:?}, but page {page} is already loaded"
                );
                return None;
            }
            (page, cause)
        };

        if !self.load_page(page, cause).await {
            return None;
        }
        self.get_neighboring_media_id(from, forward, mode)
    }

    /// Like [`Self::get_or_load_neighboring_media_id`], but wraps around at the ends.
    ///
    /// Going backwards only wraps to the end once the end of the results is known, so it
    /// never lands on something that isn't actually the last result.
    pub async fn get_neighboring_media_id_with_loop(
        self: &Arc<Self>,
        from: Option<&MediaId>,
        forward: bool,
        mode: MangaMode,
    ) -> Option<MediaId> {
        if let Some(media_id) = self.get_or_load_neighboring_media_id(from, forward, mode).await {
            return Some(media_id);
        }

        let state = lock(&self.state);
        if forward {
            state.id_list.first_id()
        } else if state.first_empty_page.is_some() {
            state.id_list.last_id()
        } else {
            None
        }
    }
}

fn can_load_page(id_list: &IdList, page: u32) -> bool {
    match (id_list.lowest_loaded_page(), id_list.highest_loaded_page()) {
        (Some(lowest), Some(highest)) => (lowest..=highest + 1).contains(&page),
        _ => true,
    }
}
