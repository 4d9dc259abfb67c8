use std::collections::{BTreeMap, HashSet};

use crate::backend::media_id::MediaId;

/// How navigation treats the pages of a multi-page work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MangaMode {
    /// Step through the list as-is, one entry at a time.
    #[default]
    Normal,
    /// Skip past the current work and land on page 0 of the next one.
    SkipToFirst,
    /// Skip past the current work and land on the first entry reached in the next one.
    SkipPast,
}

/// The IDs a data source has loaded, by page number. Pages start at 1 and may have gaps.
///
/// Each ID appears at most once in the whole list.
#[derive(Debug, Clone, Default)]
pub struct IdList {
    pages: BTreeMap<u32, Vec<MediaId>>,
}

impl IdList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a page's IDs in order, replacing anything already stored for that page.
    ///
    /// IDs that are already on another page are dropped, which happens when results shift
    /// between page loads.
    pub fn add_page(&mut self, page: u32, media_ids: Vec<MediaId>) {
        let mut seen = HashSet::new();
        let media_ids = media_ids
            .into_iter()
            .filter(|media_id| {
                if !seen.insert(media_id.clone()) {
                    return false;
                }
                match self.page_for_exact(media_id) {
                    Some((other, _)) if other != page => {
                        log::debug!("{media_id} on page {page} is already on page {other}");
                        false
                    }
                    _ => true,
                }
            })
            .collect();

        self.pages.insert(page, media_ids);
    }

    pub fn page(&self, page: u32) -> Option<&[MediaId]> {
        self.pages.get(&page).map(Vec::as_slice)
    }

    pub fn is_page_loaded(&self, page: u32) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn any_pages_loaded(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn lowest_loaded_page(&self) -> Option<u32> {
        self.pages.keys().next().copied()
    }

    pub fn highest_loaded_page(&self) -> Option<u32> {
        self.pages.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.pages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaId> {
        self.pages.values().flatten()
    }

    /// The first ID in the list.
    pub fn first_id(&self) -> Option<MediaId> {
        self.pages.values().flatten().next().cloned()
    }

    /// The last ID in the run of contiguous pages starting at the lowest loaded page.
    pub fn last_id(&self) -> Option<MediaId> {
        let mut page = self.lowest_loaded_page()?;
        while self.is_page_loaded(page + 1) {
            page += 1;
        }

        (self.lowest_loaded_page()?..=page)
            .rev()
            .find_map(|page| self.pages.get(&page).and_then(|ids| ids.last()))
            .cloned()
    }

    fn page_for_exact(&self, media_id: &MediaId) -> Option<(u32, usize)> {
        self.pages.iter().find_map(|(page, ids)| {
            ids.iter()
                .position(|id| id == media_id)
                .map(|index| (*page, index))
        })
    }

    /// Find the page and index of `media_id`. If a page of a work isn't listed but the work's
    /// first page is, that's returned instead.
    pub fn page_for_media_id(&self, media_id: &MediaId) -> Option<(u32, usize)> {
        self.page_for_exact(media_id).or_else(|| {
            if media_id.is_first_page() {
                None
            } else {
                self.page_for_exact(&media_id.first_page())
            }
        })
    }

    /// Step one entry from a position, crossing into adjacent loaded pages. Empty loaded
    /// pages are stepped over.
    fn step(&self, page: u32, index: usize, forward: bool) -> Option<(u32, usize)> {
        if forward {
            if index + 1 < self.pages.get(&page)?.len() {
                return Some((page, index + 1));
            }

            let mut next = page + 1;
            loop {
                let ids = self.pages.get(&next)?;
                if !ids.is_empty() {
                    return Some((next, 0));
                }
                next += 1;
            }
        } else {
            if index > 0 {
                return Some((page, index - 1));
            }

            let mut prev = page.checked_sub(1)?;
            loop {
                let ids = self.pages.get(&prev)?;
                if let Some(last) = ids.len().checked_sub(1) {
                    return Some((prev, last));
                }
                prev = prev.checked_sub(1)?;
            }
        }
    }

    /// Return the ID after (or before) `from`, or None if that's past the loaded data.
    ///
    /// With no `from`, returns the first ID (or the last, going backwards).
    pub fn get_neighboring_media_id(
        &self,
        from: Option<&MediaId>,
        forward: bool,
        mode: MangaMode,
    ) -> Option<MediaId> {
        let Some(from) = from else {
            return if forward {
                self.first_id()
            } else {
                self.last_id()
            };
        };

        let (mut page, mut index) = self.page_for_media_id(from)?;
        loop {
            (page, index) = self.step(page, index, forward)?;
            let candidate = &self.pages[&page][index];
            match mode {
                MangaMode::Normal => return Some(candidate.clone()),
                _ if candidate.same_work(from) => continue,
                MangaMode::SkipToFirst => return Some(candidate.first_page()),
                MangaMode::SkipPast => return Some(candidate.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<MediaId> {
        list.iter().map(|id| id.parse().unwrap()).collect()
    }

    fn id(s: &str) -> MediaId {
        s.parse().unwrap()
    }

    fn two_pages() -> IdList {
        let mut list = IdList::new();
        list.add_page(1, ids(&["work:1", "work:2"]));
        list.add_page(2, ids(&["work:3", "work:4"]));
        list
    }

    #[test]
    fn test_neighbors_across_pages() {
        let list = two_pages();
        let next = |from: &str| list.get_neighboring_media_id(Some(&id(from)), true, MangaMode::Normal);
        let prev = |from: &str| list.get_neighboring_media_id(Some(&id(from)), false, MangaMode::Normal);

        assert_eq!(next("work:1"), Some(id("work:2")));
        assert_eq!(next("work:2"), Some(id("work:3")));
        assert_eq!(next("work:4"), None);
        assert_eq!(prev("work:1"), None);

        for start in ["work:2", "work:3"] {
            let forward = next(start).unwrap();
            assert_eq!(prev(&forward.to_string()), Some(id(start)));
            let back = prev(start).unwrap();
            assert_eq!(next(&back.to_string()), Some(id(start)));
        }
    }

    #[test]
    fn test_no_start_gives_ends() {
        let list = two_pages();
        assert_eq!(list.get_neighboring_media_id(None, true, MangaMode::Normal), Some(id("work:1")));
        assert_eq!(list.get_neighboring_media_id(None, false, MangaMode::Normal), Some(id("work:4")));
        assert_eq!(IdList::new().get_neighboring_media_id(None, true, MangaMode::Normal), None);
    }

    #[test]
    fn test_manga_modes() {
        let mut list = IdList::new();
        list.add_page(1, ids(&["work:1", "work:5", "work:5-1", "work:5-2", "work:9"]));

        let from = id("work:5");
        assert_eq!(
            list.get_neighboring_media_id(Some(&from), true, MangaMode::Normal),
            Some(id("work:5-1"))
        );
        assert_eq!(
            list.get_neighboring_media_id(Some(&from), true, MangaMode::SkipToFirst),
            Some(id("work:9"))
        );
        assert_eq!(
            list.get_neighboring_media_id(Some(&id("work:9")), false, MangaMode::SkipToFirst),
            Some(id("work:5"))
        );
        assert_eq!(
            list.get_neighboring_media_id(Some(&id("work:9")), false, MangaMode::SkipPast),
            Some(id("work:5-2"))
        );
        assert_eq!(
            list.get_neighboring_media_id(Some(&id("work:5-1")), false, MangaMode::SkipPast),
            Some(id("work:1"))
        );
    }

    #[test]
    fn test_skip_stops_at_end_of_loaded_data() {
        let mut list = IdList::new();
        list.add_page(1, ids(&["work:1", "work:5", "work:5-1"]));
        assert_eq!(
            list.get_neighboring_media_id(Some(&id("work:5")), true, MangaMode::SkipToFirst),
            None
        );
    }

    #[test]
    fn test_sparse_pages_and_empty_pages() {
        let mut list = IdList::new();
        list.add_page(3, ids(&["work:1"]));
        list.add_page(4, vec![]);
        list.add_page(5, ids(&["work:2"]));
        list.add_page(7, ids(&["work:3"]));

        assert_eq!(list.lowest_loaded_page(), Some(3));
        assert_eq!(list.highest_loaded_page(), Some(7));
        assert_eq!(
            list.get_neighboring_media_id(Some(&id("work:1")), true, MangaMode::Normal),
            Some(id("work:2"))
        );
        assert_eq!(
            list.get_neighboring_media_id(Some(&id("work:2")), true, MangaMode::Normal),
            None
        );
        assert_eq!(list.last_id(), Some(id("work:2")));
    }

    #[test]
    fn test_page_lookup_and_dedup() {
        let mut list = two_pages();
        assert_eq!(list.page_for_media_id(&id("work:3")), Some((2, 0)));
        assert_eq!(list.page_for_media_id(&id("work:3-2")), Some((2, 0)));
        assert_eq!(list.page_for_media_id(&id("work:99")), None);

        // Results shifted: work:4 shows up again on page 3.
        list.add_page(3, ids(&["work:4", "work:5", "work:5"]));
        assert_eq!(list.page(3).unwrap(), ids(&["work:5"]).as_slice());

        // Reloading a page with a superset replaces it.
        list.add_page(1, ids(&["work:1", "work:2", "work:6"]));
        assert_eq!(list.page(1).unwrap().len(), 3);
        assert_eq!(list.len(), 6);
    }
}
