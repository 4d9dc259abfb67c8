use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::provider::Sources;
use super::url_state::UrlState;
use super::DataSource;
use crate::config::Settings;
use crate::sync::lock;

#[derive(Default)]
struct Registered {
    sources: HashMap<String, Arc<DataSource>>,
    active: Option<Arc<DataSource>>,
}

/// Keeps one data source per listing, so returning to a listing keeps its loaded results.
///
/// URLs are matched by their canonical form, so a change to the viewed media or start page
/// reuses the same source.
pub struct DataSourceRegistry {
    settings: Settings,
    sources: Sources,
    registered: Mutex<Registered>,
}

impl DataSourceRegistry {
    pub fn new(settings: Settings, sources: Sources) -> Self {
        DataSourceRegistry {
            settings,
            sources,
            registered: Mutex::new(Registered::default()),
        }
    }

    pub fn get_or_create(&self, url: &UrlState) -> Arc<DataSource> {
        let key = url.canonical();
        let mut registered = lock(&self.registered);
        if let Some(source) = registered.sources.get(&key) {
            return Arc::clone(source);
        }

        let source = DataSource::new(url.clone(), self.sources.clone(), &self.settings);
        registered.sources.insert(key, Arc::clone(&source));
        source
    }

    /// Make the source for `url` the active one and start it, stopping the previously active
    /// source. A transient source is forgotten once it's no longer active.
    pub fn activate(&self, url: &UrlState) -> Arc<DataSource> {
        let source = self.get_or_create(url);
        let previous = {
            let mut registered = lock(&self.registered);
            let previous = registered.active.replace(Arc::clone(&source));
            if let Some(previous) = &previous {
                if !Arc::ptr_eq(previous, &source) && previous.is_transient() {
                    registered.sources.remove(previous.canonical_url());
                }
            }
            previous
        };

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &source) {
                previous.shutdown();
            }
        }

        source.set_url_state(url.clone());
        source.startup();
        source
    }

    /// Forget the source for `url`, so the next visit starts over.
    pub fn discard(&self, url: &UrlState) {
        let key = url.canonical();
        let removed = {
            let mut registered = lock(&self.registered);
            if registered
                .active
                .as_ref()
                .is_some_and(|active| active.canonical_url() == key)
            {
                registered.active = None;
            }
            registered.sources.remove(&key)
        };

        if let Some(source) = removed {
            source.shutdown();
        }
    }

    pub fn active(&self) -> Option<Arc<DataSource>> {
        lock(&self.registered).active.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.registered).sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
