use std::fmt;
use std::str::FromStr;
use url::{Url, form_urlencoded};

use crate::backend::media_id::MediaId;

const PAGE_PARAM: &str = "p";
const MEDIA_ARG: &str = "media";

/// Fragment args that describe what's being viewed, not what's being listed.
const VIEW_ARGS: &[&str] = &[MEDIA_ARG, "view"];

/// An immutable snapshot of a navigation URL.
///
/// The query describes the listing (search terms, ordering, the page to start on). The
/// fragment holds `&`-separated args for viewer state, like the media being shown. Changes
/// produce a new snapshot rather than editing this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlState {
    url: Url,
}

impl UrlState {
    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(UrlState {
            url: Url::parse(url)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query_arg(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn hash_args(&self) -> Vec<(String, String)> {
        match self.url.fragment() {
            Some(fragment) => form_urlencoded::parse(fragment.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn hash_arg(&self, key: &str) -> Option<String> {
        self.hash_args()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// The page the listing starts on, from `p`. Pages start at 1.
    pub fn page(&self) -> Option<u32> {
        self.query_arg(PAGE_PARAM)?
            .parse()
            .ok()
            .filter(|page| *page >= 1)
    }

    /// The media being viewed, if any.
    pub fn media_id(&self) -> Option<MediaId> {
        self.hash_arg(MEDIA_ARG)?.parse().ok()
    }

    pub fn with_media_id(&self, media_id: Option<&MediaId>) -> UrlState {
        let mut args: Vec<(String, String)> = self
            .hash_args()
            .into_iter()
            .filter(|(k, _)| k != MEDIA_ARG)
            .collect();
        if let Some(media_id) = media_id {
            args.push((MEDIA_ARG.to_string(), media_id.to_string()));
        }

        let mut url = self.url.clone();
        set_fragment_args(&mut url, &args);
        UrlState { url }
    }

    /// Page 1 is the default and isn't written out.
    pub fn with_page(&self, page: u32) -> UrlState {
        let mut pairs = self.query_pairs_without_page();
        if page > 1 {
            pairs.push((PAGE_PARAM.to_string(), page.to_string()));
        }

        let mut url = self.url.clone();
        set_query_pairs(&mut url, &pairs);
        UrlState { url }
    }

    /// The URL with viewer state and the start page removed and the remaining args sorted.
    ///
    /// URLs that list the same thing have the same canonical form.
    pub fn canonical(&self) -> String {
        let mut pairs = self.query_pairs_without_page();
        pairs.sort();

        let mut args: Vec<(String, String)> = self
            .hash_args()
            .into_iter()
            .filter(|(k, _)| !VIEW_ARGS.contains(&k.as_str()))
            .collect();
        args.sort();

        let mut url = self.url.clone();
        set_query_pairs(&mut url, &pairs);
        set_fragment_args(&mut url, &args);
        url.to_string()
    }

    pub(crate) fn query_pairs_without_page(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .into_owned()
            .filter(|(k, _)| k != PAGE_PARAM)
            .collect()
    }
}

fn set_query_pairs(url: &mut Url, pairs: &[(String, String)]) {
    url.set_query(None);
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
}

fn set_fragment_args(url: &mut Url, args: &[(String, String)]) {
    if args.is_empty() {
        url.set_fragment(None);
        return;
    }

    let fragment = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(args)
        .finish();
    url.set_fragment(Some(&fragment));
}

impl FromStr for UrlState {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UrlState::parse(s)
    }
}

impl fmt::Display for UrlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}
