use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use super::media_id::MediaId;
use super::media_info::ExtraImageData;
use crate::error::ExtraDataError;

/// Fields every saved edit carries, which don't count as edits themselves.
const BOOKKEEPING_KEYS: &[&str] = &["mediaId", "editedAt"];

/// Persistent storage for user edits (crops, notes, and so on), one entry per page.
#[async_trait]
pub trait ExtraDataStore: Send + Sync {
    async fn load(&self, media_id: &MediaId) -> Result<Option<ExtraImageData>, ExtraDataError>;

    async fn save(&self, media_id: &MediaId, data: &ExtraImageData) -> Result<(), ExtraDataError>;

    async fn delete(&self, media_id: &MediaId) -> Result<(), ExtraDataError>;

    /// Load the edits for every page of each of `works`, keyed by work (first-page) ID.
    async fn load_for_works(
        &self,
        works: &[MediaId],
    ) -> Result<HashMap<MediaId, BTreeMap<MediaId, ExtraImageData>>, ExtraDataError>;

    async fn load_for_work(
        &self,
        work: &MediaId,
    ) -> Result<BTreeMap<MediaId, ExtraImageData>, ExtraDataError> {
        let mut works = self.load_for_works(std::slice::from_ref(work)).await?;
        Ok(works.remove(&work.first_page()).unwrap_or_default())
    }
}

/// Merge `edits` into `existing`. Null values remove a field.
pub fn merge_edits(
    media_id: &MediaId,
    existing: Option<ExtraImageData>,
    edits: &ExtraImageData,
) -> ExtraImageData {
    let mut data = existing.unwrap_or_default();
    for (key, value) in edits {
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.clone(), value.clone());
        }
    }

    let edited_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    data.insert("mediaId".to_string(), Value::String(media_id.to_string()));
    data.insert("editedAt".to_string(), Value::from(edited_at));
    data
}

/// True if `data` holds nothing but bookkeeping, so it can be deleted.
pub fn is_empty_edit(data: &ExtraImageData) -> bool {
    data.keys().all(|key| BOOKKEEPING_KEYS.contains(&key.as_str()))
}

fn group_by_work(
    entries: &BTreeMap<MediaId, ExtraImageData>,
    works: &[MediaId],
) -> HashMap<MediaId, BTreeMap<MediaId, ExtraImageData>> {
    let mut result: HashMap<MediaId, BTreeMap<MediaId, ExtraImageData>> = works
        .iter()
        .map(|work| (work.first_page(), BTreeMap::new()))
        .collect();

    for (media_id, data) in entries {
        if let Some(pages) = result.get_mut(&media_id.first_page()) {
            pages.insert(media_id.clone(), data.clone());
        }
    }
    result
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ExtraDataFile {
    #[serde(default)]
    entries: BTreeMap<MediaId, ExtraImageData>,
}

/// Stores edits in a JSON file. The file is re-read for every operation, so edits made by
/// another process are seen.
pub struct JsonExtraDataStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonExtraDataStore {
    pub fn new(path: PathBuf) -> Self {
        JsonExtraDataStore {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<ExtraDataFile, ExtraDataError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ExtraDataFile::default());
            }
            Err(source) => {
                return Err(ExtraDataError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match serde_json::from_str(&content) {
            Ok(file) => Ok(file),
            Err(e) => {
                log::warn!("Ignoring unreadable edit data in {}: {e}", self.path.display());
                Ok(ExtraDataFile::default())
            }
        }
    }

    async fn write(&self, file: &ExtraDataFile) -> Result<(), ExtraDataError> {
        let io_error = |source| ExtraDataError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let content = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)
    }
}

#[async_trait]
impl ExtraDataStore for JsonExtraDataStore {
    async fn load(&self, media_id: &MediaId) -> Result<Option<ExtraImageData>, ExtraDataError> {
        Ok(self.read().await?.entries.remove(media_id))
    }

    async fn save(&self, media_id: &MediaId, data: &ExtraImageData) -> Result<(), ExtraDataError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        file.entries.insert(media_id.clone(), data.clone());
        self.write(&file).await
    }

    async fn delete(&self, media_id: &MediaId) -> Result<(), ExtraDataError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        if file.entries.remove(media_id).is_some() {
            self.write(&file).await?;
        }
        Ok(())
    }

    async fn load_for_works(
        &self,
        works: &[MediaId],
    ) -> Result<HashMap<MediaId, BTreeMap<MediaId, ExtraImageData>>, ExtraDataError> {
        let file = self.read().await?;
        Ok(group_by_work(&file.entries, works))
    }
}

/// Keeps edits in memory only, for sessions that shouldn't persist anything.
#[derive(Default)]
pub struct MemoryExtraDataStore {
    entries: Mutex<BTreeMap<MediaId, ExtraImageData>>,
}

impl MemoryExtraDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExtraDataStore for MemoryExtraDataStore {
    async fn load(&self, media_id: &MediaId) -> Result<Option<ExtraImageData>, ExtraDataError> {
        Ok(self.entries.lock().await.get(media_id).cloned())
    }

    async fn save(&self, media_id: &MediaId, data: &ExtraImageData) -> Result<(), ExtraDataError> {
        self.entries
            .lock()
            .await
            .insert(media_id.clone(), data.clone());
        Ok(())
    }

    async fn delete(&self, media_id: &MediaId) -> Result<(), ExtraDataError> {
        self.entries.lock().await.remove(media_id);
        Ok(())
    }

    async fn load_for_works(
        &self,
        works: &[MediaId],
    ) -> Result<HashMap<MediaId, BTreeMap<MediaId, ExtraImageData>>, ExtraDataError> {
        Ok(group_by_work(&*self.entries.lock().await, works))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edits(value: Value) -> ExtraImageData {
        match value {
            Value::Object(map) => map,
            _ => panic!("edits must be an object"),
        }
    }

    #[test]
    fn test_merge_and_empty_detection() {
        let id = MediaId::work("1").with_page(2);
        let data = merge_edits(&id, None, &edits(json!({"note": "hi"})));
        assert_eq!(data["note"], json!("hi"));
        assert_eq!(data["mediaId"], json!("work:1-2"));
        assert!(!is_empty_edit(&data));

        let cleared = merge_edits(&id, Some(data), &edits(json!({"note": null})));
        assert!(cleared.get("note").is_none());
        assert!(is_empty_edit(&cleared));
    }

    #[tokio::test]
    async fn test_json_store_persists_by_work() {
        let path = std::env::temp_dir().join(format!("pixview-extra-{}.json", std::process::id()));
        let store = JsonExtraDataStore::new(path.clone());
        let page0 = MediaId::work("5");
        let page3 = MediaId::work("5").with_page(3);
        let other = MediaId::work("6");

        store.save(&page0, &edits(json!({"crop": [1, 2, 3, 4]}))).await.unwrap();
        store.save(&page3, &edits(json!({"note": "x"}))).await.unwrap();
        store.save(&other, &edits(json!({"note": "y"}))).await.unwrap();

        // A second handle on the same file sees the same data.
        let reopened = JsonExtraDataStore::new(path.clone());
        let pages = reopened.load_for_work(&page3).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages.contains_key(&page3));

        reopened.delete(&page3).await.unwrap();
        assert!(store.load(&page3).await.unwrap().is_none());
        assert!(store.load(&other).await.unwrap().is_some());

        tokio::fs::remove_file(&path).await.ok();
    }
}
