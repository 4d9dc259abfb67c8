use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::media_id::MediaId;
use super::media_info::{ExtraImageData, MediaInfo};
use crate::events::Subscribers;
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// One record was added or changed.
    Modified(MediaId),
    /// A bulk load stored these records. Sent once per event-loop turn.
    BulkLoaded(Vec<MediaId>),
}

/// How a write should be announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    Single,
    Bulk,
}

#[derive(Default)]
struct Records {
    media: HashMap<MediaId, Arc<MediaInfo>>,
    nonexistent: HashMap<MediaId, String>,
    /// Edits saved this session, by work and then page. `None` is a deleted edit.
    edits: HashMap<MediaId, BTreeMap<MediaId, Option<ExtraImageData>>>,
}

impl Records {
    fn apply_edits(&self, info: &mut MediaInfo) {
        let Some(pages) = self.edits.get(&info.media_id) else {
            return;
        };
        for (page, edit) in pages {
            match edit {
                Some(data) => {
                    info.extra_data.insert(page.clone(), data.clone());
                }
                None => {
                    info.extra_data.remove(page);
                }
            }
        }
    }
}

struct MediaEvents {
    subscribers: Subscribers<MediaEvent>,
    pending_bulk: Mutex<Option<BTreeSet<MediaId>>>,
}

impl MediaEvents {
    fn queue_bulk(self: &Arc<Self>, media_id: MediaId) {
        let schedule = {
            let mut pending = lock(&self.pending_bulk);
            let schedule = pending.is_none();
            pending.get_or_insert_with(BTreeSet::new).insert(media_id);
            schedule
        };

        if !schedule {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let events = Arc::clone(self);
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    events.flush_bulk();
                });
            }
            // Outside a runtime there's no later turn to coalesce onto.
            Err(_) => self.flush_bulk(),
        }
    }

    fn flush_bulk(&self) {
        let Some(ids) = lock(&self.pending_bulk).take() else {
            return;
        };
        self.subscribers
            .emit(MediaEvent::BulkLoaded(ids.into_iter().collect()));
    }
}

/// Every record known this session, keyed by first-page media ID, plus the IDs known not to exist.
///
/// Records are never evicted.
pub struct MediaStore {
    records: Mutex<Records>,
    events: Arc<MediaEvents>,
}

impl MediaStore {
    pub fn new() -> Self {
        MediaStore {
            records: Mutex::new(Records::default()),
            events: Arc::new(MediaEvents {
                subscribers: Subscribers::new(),
                pending_bulk: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MediaEvent> {
        self.events.subscribers.subscribe()
    }

    pub fn get(&self, media_id: &MediaId) -> Option<Arc<MediaInfo>> {
        lock(&self.records).media.get(media_id).cloned()
    }

    pub fn has(&self, media_id: &MediaId) -> bool {
        lock(&self.records).media.contains_key(media_id)
    }

    /// Store a record, returning whatever record is stored afterwards.
    ///
    /// A partial record never replaces a full one: the full record is kept and returned.
    /// Replacing a partial record keeps its edit overlay if the new record has none. Edits
    /// saved this session are applied over whatever overlay the record carries.
    pub fn set(&self, mut info: MediaInfo, notify: Notify) -> Arc<MediaInfo> {
        let media_id = info.media_id.clone();
        let stored = {
            let mut records = lock(&self.records);
            if let Some(existing) = records.media.get(&media_id) {
                if existing.full && !info.full {
                    log::debug!("Not replacing full info for {media_id} with partial info");
                    return Arc::clone(existing);
                }

                if !info.full && info.extra_data.is_empty() {
                    info.extra_data = existing.extra_data.clone();
                }
            }

            records.apply_edits(&mut info);
            if let Some(existing) = records.media.get(&media_id) {
                if **existing == info {
                    return Arc::clone(existing);
                }
            }

            let stored = Arc::new(info);
            records.media.insert(media_id.clone(), Arc::clone(&stored));
            stored
        };

        self.announce(media_id, notify);
        stored
    }

    /// Replace a record with the result of `update`, if a record exists and `update` returns one.
    ///
    /// The read and the write happen under one lock.
    pub fn modify<F>(&self, media_id: &MediaId, update: F) -> Option<Arc<MediaInfo>>
    where
        F: FnOnce(&MediaInfo) -> Option<MediaInfo>,
    {
        let stored = {
            let mut records = lock(&self.records);
            let existing = records.media.get(media_id)?;
            let updated = update(existing)?;
            if updated == **existing {
                return Some(Arc::clone(existing));
            }
            let stored = Arc::new(updated);
            records.media.insert(media_id.clone(), Arc::clone(&stored));
            stored
        };

        self.announce(media_id.clone(), Notify::Single);
        Some(stored)
    }

    /// Record an edit saved this session and patch the loaded record, if there is one.
    /// `None` deletes the edit.
    ///
    /// Every later write applies the edit too, so a load that read older edits can't undo it.
    pub fn save_edit(&self, media_id: &MediaId, edit: Option<ExtraImageData>) -> Option<Arc<MediaInfo>> {
        let work = media_id.first_page();
        let stored = {
            let mut records = lock(&self.records);
            records
                .edits
                .entry(work.clone())
                .or_default()
                .insert(media_id.clone(), edit);

            let existing = records.media.get(&work)?;
            let mut info = MediaInfo::clone(existing);
            records.apply_edits(&mut info);
            if info == **existing {
                return Some(Arc::clone(existing));
            }
            let stored = Arc::new(info);
            records.media.insert(work.clone(), Arc::clone(&stored));
            stored
        };

        self.announce(work, Notify::Single);
        Some(stored)
    }

    fn announce(&self, media_id: MediaId, notify: Notify) {
        match notify {
            Notify::Single => self.events.subscribers.emit(MediaEvent::Modified(media_id)),
            Notify::Bulk => self.events.queue_bulk(media_id),
        }
    }

    pub fn mark_nonexistent(&self, media_id: MediaId, reason: impl Into<String>) {
        let reason = reason.into();
        log::debug!("Marking {media_id} as nonexistent: {reason}");
        lock(&self.records).nonexistent.insert(media_id, reason);
    }

    pub fn nonexistent_reason(&self, media_id: &MediaId) -> Option<String> {
        lock(&self.records).nonexistent.get(media_id).cloned()
    }

    pub fn is_nonexistent(&self, media_id: &MediaId) -> bool {
        lock(&self.records).nonexistent.contains_key(media_id)
    }

    pub fn clear_nonexistent(&self, media_id: &MediaId) {
        lock(&self.records).nonexistent.remove(media_id);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).media.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MediaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{full_info, partial_info};

    #[test]
    fn test_full_dominates_partial() {
        let store = MediaStore::new();
        let full = store.set(full_info("work:1", 3), Notify::Single);
        let kept = store.set(partial_info("work:1", 3), Notify::Single);

        assert!(Arc::ptr_eq(&full, &kept));
        assert!(store.get(&MediaId::work("1")).unwrap().full);
        assert_eq!(store.get(&MediaId::work("1")).unwrap().manga_pages().len(), 3);
    }

    #[test]
    fn test_single_events_fire_only_on_change() {
        let store = MediaStore::new();
        let mut events = store.subscribe();

        store.set(partial_info("work:1", 1), Notify::Single);
        store.set(partial_info("work:1", 1), Notify::Single);
        assert_eq!(events.try_recv().unwrap(), MediaEvent::Modified(MediaId::work("1")));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bulk_events_coalesce() {
        let store = MediaStore::new();
        let mut events = store.subscribe();

        for id in ["work:3", "work:1", "work:2", "work:1"] {
            let mut info = partial_info(id, 1);
            info.illust_title = format!("{id} again");
            store.set(info, Notify::Bulk);
        }
        assert!(events.try_recv().is_err(), "bulk event is deferred");

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            MediaEvent::BulkLoaded(vec![
                MediaId::work("1"),
                MediaId::work("2"),
                MediaId::work("3")
            ])
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_saved_edits_survive_later_writes() {
        let store = MediaStore::new();
        let page = MediaId::work("4").with_page(1);
        let mut note = ExtraImageData::new();
        note.insert("note".into(), serde_json::json!("hi"));

        // Saved before the record exists, then applied when it's stored.
        assert!(store.save_edit(&page, Some(note.clone())).is_none());
        let stored = store.set(full_info("work:4", 2), Notify::Single);
        assert_eq!(stored.extra_data_for(&page), Some(&note));

        // A write carrying an older overlay doesn't bring a deleted edit back.
        store.save_edit(&page, None);
        let mut stale = full_info("work:4", 2);
        stale.extra_data.insert(page.clone(), note);
        let stored = store.set(stale, Notify::Single);
        assert!(stored.extra_data.is_empty());
    }

    #[test]
    fn test_negative_cache() {
        let store = MediaStore::new();
        let id = MediaId::work("9");
        store.mark_nonexistent(id.clone(), "deleted");
        assert_eq!(store.nonexistent_reason(&id).as_deref(), Some("deleted"));
        store.clear_nonexistent(&id);
        assert!(!store.is_nonexistent(&id));
    }
}
