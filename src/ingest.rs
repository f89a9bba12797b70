use std::time::Duration;

use feed_rs::model::{Entry, Feed};
use feed_rs::parser::{self, ParseFeedError};
use reqwest::Client;
use scraper::{Html, Node};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::config::FetchConfig;
use crate::model::{Article, FeedSnapshot, NO_DESCRIPTION, NO_TITLE, UNKNOWN_FEED};

pub const FETCH_FAILED: &str = "Failed to fetch or parse RSS feed";

/// Elements whose text is separated from its neighbours by a space.
const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "tr", "td", "blockquote", "h1", "h2", "h3", "h4", "h5",
    "h6", "hr", "pre",
];

/// Elements whose text never reaches a snippet.
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// The caller's input was unusable. Nothing was sent over the network.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("URL is required")]
    Missing,
    #[error("Invalid URL format")]
    Malformed(#[source] url::ParseError),
    /// The request carried something other than a string for the URL
    #[error("Invalid URL format")]
    NotText,
}

/// Retrieval or parsing failed. All variants look the same to HTTP clients.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    Status(u16),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseFeedError),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl IngestError {
    pub fn is_validation(&self) -> bool {
        matches!(self, IngestError::Validation(_))
    }

    /// Message safe to show to users. Fetch failures are collapsed into one
    /// generic message; the detailed cause only goes to the log.
    pub fn public_message(&self) -> String {
        match self {
            IngestError::Validation(e) => e.to_string(),
            IngestError::Fetch(_) => FETCH_FAILED.to_string(),
        }
    }
}

pub struct Ingestor {
    client: Client,
}

impl Ingestor {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self { client })
    }

    /// Fetch, parse and normalize the feed at `url`.
    pub async fn fetch_feed(&self, url: &str) -> Result<FeedSnapshot, IngestError> {
        let parsed_url = validate_url(Some(url))?;

        info!("Fetching feed: {}", parsed_url);
        let bytes = self.download(&parsed_url).await.map_err(|e| {
            error!("RSS fetch error for {}: {}", parsed_url, e);
            e
        })?;

        let snapshot = parse_snapshot(&bytes, url).map_err(|e| {
            error!("RSS parsing error for {}: {}", parsed_url, e);
            e
        })?;

        info!(
            "Fetched {} articles from '{}'",
            snapshot.articles.len(),
            snapshot.feed_title
        );
        Ok(snapshot)
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Check that `url` is present and parses as an absolute URL.
pub fn validate_url(url: Option<&str>) -> Result<Url, ValidationError> {
    let raw = match url {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(ValidationError::Missing),
    };

    Url::parse(raw).map_err(ValidationError::Malformed)
}

/// Guess the favicon location as `scheme://host/favicon.ico`.
///
/// Port, path, query and fragment are dropped. Returns an empty string when
/// the URL has no host or does not parse; the guess is never verified.
pub fn favicon_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return String::new();
    };

    match parsed.host_str() {
        Some(host) if !host.is_empty() => format!("{}://{}/favicon.ico", parsed.scheme(), host),
        _ => String::new(),
    }
}

/// Parse raw feed bytes (RSS or Atom) into a snapshot.
pub fn parse_snapshot(bytes: &[u8], source_url: &str) -> Result<FeedSnapshot, FetchError> {
    let feed = parser::parse(bytes)?;
    Ok(snapshot_from_feed(feed, source_url))
}

pub fn snapshot_from_feed(feed: Feed, source_url: &str) -> FeedSnapshot {
    let articles = feed.entries.iter().map(normalize_entry).collect();

    FeedSnapshot {
        feed_title: feed
            .title
            .map(|t| t.content)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN_FEED.to_string()),
        feed_description: feed.description.map(|d| d.content).unwrap_or_default(),
        articles,
        favicon_url: favicon_url(source_url),
    }
}

/// Map one parsed entry onto the fixed article shape.
pub fn normalize_entry(entry: &Entry) -> Article {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| NO_TITLE.to_string());

    let link = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .unwrap_or_default();

    let raw_content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.as_deref())
        .filter(|b| !b.is_empty());

    // Plain-text snippet first, then the raw content body
    let description = entry
        .summary
        .as_ref()
        .map(|s| plain_text(&s.content))
        .filter(|s| !s.is_empty())
        .or_else(|| raw_content.map(plain_text).filter(|s| !s.is_empty()))
        .or_else(|| raw_content.map(str::to_string))
        .unwrap_or_else(|| NO_DESCRIPTION.to_string());

    let pub_date = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.to_rfc2822())
        .unwrap_or_default();

    let author = entry
        .authors
        .iter()
        .map(|p| p.name.trim())
        .find(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_default();

    Article {
        title,
        link,
        description,
        pub_date,
        author,
    }
}

/// Reduce an HTML fragment to its visible text with whitespace collapsed.
///
/// Entities are decoded by the HTML parser. Script and style bodies are
/// dropped; block elements keep a space between their text and the next.
pub fn plain_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut text = String::with_capacity(html.len());

    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_TAGS.contains(&element.name()) => text.push(' '),
            Node::Text(content) => {
                let hidden = node
                    .ancestors()
                    .filter_map(|a| a.value().as_element())
                    .any(|e| HIDDEN_TAGS.contains(&e.name()));
                if hidden {
                    continue;
                }

                let after_block = node
                    .prev_sibling()
                    .and_then(|s| s.value().as_element())
                    .is_some_and(|e| BLOCK_TAGS.contains(&e.name()));
                if after_block {
                    text.push(' ');
                }
                text.push_str(content);
            }
            _ => {}
        }
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
