use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::media_id::MediaId;
use super::media_info::MediaInfo;
use crate::sync::lock;

pub type LoadResult = Option<Arc<MediaInfo>>;
pub type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadKind {
    Full,
    Partial,
}

/// Tracks loads in progress so concurrent requests for the same media share one request.
///
/// Each load is spawned onto the runtime, so it runs to completion and deregisters itself
/// even if every caller stops waiting on it.
#[derive(Clone, Default)]
pub struct RequestCoalescer {
    in_flight: Arc<Mutex<HashMap<(MediaId, LoadKind), SharedLoad>>>,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a load that can answer a request of `kind`. A full load satisfies a partial request,
    /// but not the other way around.
    pub fn find_satisfying(&self, media_id: &MediaId, kind: LoadKind) -> Option<SharedLoad> {
        let in_flight = lock(&self.in_flight);
        let full = in_flight.get(&(media_id.clone(), LoadKind::Full));
        match kind {
            LoadKind::Full => full.cloned(),
            LoadKind::Partial => full
                .or_else(|| in_flight.get(&(media_id.clone(), LoadKind::Partial)))
                .cloned(),
        }
    }

    /// Return the load in progress for this key, or start one with `factory`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get_or_start<F>(&self, media_id: &MediaId, kind: LoadKind, factory: F) -> SharedLoad
    where
        F: FnOnce() -> BoxFuture<'static, LoadResult>,
    {
        let key = (media_id.clone(), kind);
        let mut in_flight = lock(&self.in_flight);
        if let Some(load) = in_flight.get(&key) {
            return load.clone();
        }

        let registry = Arc::clone(&self.in_flight);
        let load = factory();
        let remove_key = key.clone();
        let shared = async move {
            let result = load.await;
            lock(&registry).remove(&remove_key);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(key, shared.clone());
        drop(in_flight);

        tokio::spawn(shared.clone());
        shared
    }

    pub fn is_loading(&self, media_id: &MediaId, kind: LoadKind) -> bool {
        lock(&self.in_flight).contains_key(&(media_id.clone(), kind))
    }
}
