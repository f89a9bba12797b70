use serde::{Deserialize, Serialize};
use url::Url;

pub const NO_TITLE: &str = "No title";
pub const NO_DESCRIPTION: &str = "No description";
pub const UNKNOWN_FEED: &str = "Unknown Feed";

/// One normalized feed entry. Every field is always present; missing
/// source data is replaced by a fixed default at ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub title: String,
    pub link: String,
    pub description: String,
    /// Opaque date text, never parsed back
    pub pub_date: String,
    pub author: String,
}

impl Article {
    /// Whether `link` is safe to render as a clickable http(s) link.
    pub fn has_web_link(&self) -> bool {
        Url::parse(&self.link).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }
}

/// The normalized result of one successful fetch. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub feed_title: String,
    pub feed_description: String,
    pub articles: Vec<Article>,
    #[serde(default)]
    pub favicon_url: String,
}

pub type TabId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: TabId,
    pub title: String,
    pub url: String,
    pub data: Option<FeedSnapshot>,
    #[serde(default)]
    pub is_loading: bool,
    /// Snapshot held back while a refresh is in flight, restored if it fails
    #[serde(skip)]
    pub(crate) last_good: Option<FeedSnapshot>,
}

impl Tab {
    pub fn article_count(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.articles.len())
    }
}
