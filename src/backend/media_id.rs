use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    Work,
    File,
    Folder,
}

impl MediaKind {
    fn prefix(self) -> &'static str {
        match self {
            MediaKind::Work => "work",
            MediaKind::File => "file",
            MediaKind::Folder => "folder",
        }
    }
}

/// Identifies one media item, optionally a specific page of a multi-page work.
///
/// Remote works are written `work:<id>` or `work:<id>-<page>`. Local items are
/// `file:<path>` and `folder:<path>`, which never carry a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaId {
    kind: MediaKind,
    id: String,
    page: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid media ID: {0:?}")]
pub struct InvalidMediaId(pub String);

impl MediaId {
    pub fn work(id: impl Into<String>) -> Self {
        MediaId {
            kind: MediaKind::Work,
            id: id.into(),
            page: 0,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        MediaId {
            kind: MediaKind::File,
            id: path.into(),
            page: 0,
        }
    }

    /// Parse a bare work ID like "42", as found in URLs and API responses.
    pub fn parse_work(id: &str) -> Result<Self, InvalidMediaId> {
        match format!("work:{id}").parse::<MediaId>() {
            Ok(media_id) if media_id.is_first_page() => Ok(media_id),
            _ => Err(InvalidMediaId(id.to_string())),
        }
    }

    pub fn folder(path: impl Into<String>) -> Self {
        MediaId {
            kind: MediaKind::Folder,
            id: path.into(),
            page: 0,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The ID without type or page, eg. "42" for `work:42-3`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, MediaKind::File | MediaKind::Folder)
    }

    /// The cache key form: page 0 of the same work.
    pub fn first_page(&self) -> MediaId {
        self.with_page(0)
    }

    pub fn is_first_page(&self) -> bool {
        self.page == 0
    }

    /// Return this work's ID at another page. Local IDs have no pages and are returned as-is.
    pub fn with_page(&self, page: u32) -> MediaId {
        let page = if self.kind == MediaKind::Work { page } else { 0 };
        MediaId {
            kind: self.kind,
            id: self.id.clone(),
            page,
        }
    }

    /// True if both IDs refer to the same work, ignoring the page.
    pub fn same_work(&self, other: &MediaId) -> bool {
        self.kind == other.kind && self.id == other.id
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.page == 0 {
            write!(f, "{}:{}", self.kind.prefix(), self.id)
        } else {
            write!(f, "{}:{}-{}", self.kind.prefix(), self.id, self.page)
        }
    }
}

impl FromStr for MediaId {
    type Err = InvalidMediaId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMediaId(s.to_string());
        let (prefix, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }

        match prefix {
            "work" => {
                let (id, page) = match rest.split_once('-') {
                    Some((id, page)) => (id, page.parse::<u32>().map_err(|_| invalid())?),
                    None => (rest, 0),
                };
                if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                Ok(MediaId::work(id).with_page(page))
            }
            "file" => Ok(MediaId::file(rest)),
            "folder" => Ok(MediaId::folder(rest)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for MediaId {
    type Error = InvalidMediaId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MediaId> for String {
    fn from(value: MediaId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_normalize() {
        let id: MediaId = "work:42-3".parse().unwrap();
        assert_eq!(id.id(), "42");
        assert_eq!(id.page(), 3);
        assert_eq!(id.first_page().to_string(), "work:42");
        assert!(id.same_work(&MediaId::work("42")));

        let local: MediaId = "file:/pics/a-1.png".parse().unwrap();
        assert!(local.is_local());
        assert_eq!(local.page(), 0);
        assert_eq!(local.with_page(5), local);
        assert_eq!(local.to_string(), "file:/pics/a-1.png");
    }

    #[test]
    fn test_rejects_malformed_ids() {
        for bad in ["", "work:", "work:abc", "work:12-x", "user:5", "42"] {
            assert!(bad.parse::<MediaId>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_parse_bare_work_ids() {
        assert_eq!(MediaId::parse_work("42"), Ok(MediaId::work("42")));
        for bad in ["", "abc", "42-1", "4 2"] {
            assert!(MediaId::parse_work(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_serializes_as_string() {
        let id = MediaId::work("7").with_page(2);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"work:7-2\"");
        let back: MediaId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
