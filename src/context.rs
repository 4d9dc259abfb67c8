use std::sync::Arc;

use crate::backend::api::{ApiClient, HttpApiClient, HttpLocalApi, LocalApi};
use crate::backend::extra_data::{ExtraDataStore, JsonExtraDataStore};
use crate::backend::media_cache::MediaCache;
use crate::backend::user_cache::UserCache;
use crate::config::Settings;
use crate::data_source::{DataSourceRegistry, Sources};
use crate::error::ApiError;

/// The collaborators an application session shares, created once at startup.
pub struct AppContext {
    pub settings: Settings,
    pub media: MediaCache,
    pub users: Arc<UserCache>,
    pub data_sources: DataSourceRegistry,
}

impl AppContext {
    /// Build a context that talks to the configured servers and stores edits on disk.
    pub fn new(settings: Settings) -> Result<Self, ApiError> {
        let api: Arc<dyn ApiClient> = Arc::new(HttpApiClient::new(&settings)?);
        let local_api: Option<Arc<dyn LocalApi>> = match &settings.local_api_url {
            Some(url) => Some(Arc::new(HttpLocalApi::new(&settings, url)?)),
            None => None,
        };
        let extra_data = Arc::new(JsonExtraDataStore::new(settings.extra_data_path()));
        log::debug!("Storing edits in {}", extra_data.path().display());

        Ok(Self::with_collaborators(settings, api, local_api, extra_data))
    }

    pub fn with_collaborators(
        settings: Settings,
        api: Arc<dyn ApiClient>,
        local_api: Option<Arc<dyn LocalApi>>,
        extra_data: Arc<dyn ExtraDataStore>,
    ) -> Self {
        let users = Arc::new(UserCache::new());
        let media = MediaCache::new(
            &settings,
            Arc::clone(&api),
            local_api.clone(),
            extra_data,
            Arc::clone(&users),
        );
        let data_sources = DataSourceRegistry::new(
            settings.clone(),
            Sources {
                api,
                local_api,
                media: media.clone(),
            },
        );

        AppContext {
            settings,
            media,
            users,
            data_sources,
        }
    }
}
