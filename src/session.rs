//! Tab session: an ordered list of feed tabs plus the selected tab.
//!
//! All mutation goes through [`SessionStore`], which updates memory
//! synchronously and hands a copy of the new state to the [`Persister`].
//! [`Session`] wraps the store for shared use and runs the ingestion call
//! for refreshes without holding the store lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::db::Database;
use crate::ingest::{IngestError, Ingestor};
use crate::model::{FeedSnapshot, Tab, TabId};

pub const TABS_KEY: &str = "rss-reader-tabs";
pub const ACTIVE_TAB_KEY: &str = "rss-reader-active-tab";

pub const NEW_TAB_TITLE: &str = "New Feed";
pub const DEFAULT_FEED_TITLE: &str = "RSS Feed";

static TAB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cannot remove the last tab")]
    LastTab,
    #[error("No tab with id {0}")]
    UnknownTab(TabId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Transient message about the last user action, shown once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == NoticeLevel::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { articles: usize },
    Failed { message: String },
    /// The tab was removed while its fetch was in flight
    Discarded,
}

enum PersistCommand {
    SaveTabs(String),
    SaveSelected(TabId),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Ordered, fire-and-forget writer for the persisted session.
///
/// Commands are applied one at a time in the order they were sent. Write
/// failures are logged and dropped; memory stays authoritative.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl Persister {
    pub fn spawn(db: Database) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(db, rx));
        Self { tx }
    }

    pub fn save_tabs(&self, tabs: &[Tab]) {
        match serde_json::to_string(tabs) {
            Ok(json) => self.send(PersistCommand::SaveTabs(json)),
            Err(e) => warn!("Failed to serialize tabs: {}", e),
        }
    }

    pub fn save_selected(&self, id: &str) {
        self.send(PersistCommand::SaveSelected(id.to_string()));
    }

    pub fn clear(&self) {
        self.send(PersistCommand::Clear);
    }

    /// Wait until every command sent before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(PersistCommand::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn send(&self, command: PersistCommand) {
        if self.tx.send(command).is_err() {
            warn!("Session writer has stopped; change kept in memory only");
        }
    }
}

async fn run_writer(db: Database, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(command) = rx.recv().await {
        let result = match command {
            PersistCommand::SaveTabs(json) => db.set_value(TABS_KEY, &json).await,
            PersistCommand::SaveSelected(id) => db.set_value(ACTIVE_TAB_KEY, &id).await,
            PersistCommand::Clear => clear_persisted(&db).await,
            PersistCommand::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Failed to persist session state: {}", e);
        }
    }
}

async fn clear_persisted(db: &Database) -> anyhow::Result<()> {
    db.remove_value(TABS_KEY).await?;
    db.remove_value(ACTIVE_TAB_KEY).await?;
    Ok(())
}

fn next_tab_id() -> TabId {
    let seq = TAB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("tab-{}-{}", Utc::now().timestamp_millis(), seq)
}

pub struct SessionStore {
    tabs: Vec<Tab>,
    selected: Option<TabId>,
    notice: Option<Notice>,
    persister: Persister,
}

impl SessionStore {
    pub fn new(persister: Persister) -> Self {
        Self {
            tabs: Vec::new(),
            selected: None,
            notice: None,
            persister,
        }
    }

    /// Rebuild the session from the persisted snapshot.
    ///
    /// Missing or unreadable entries give an empty session. Restored tabs are
    /// never loading since no fetch survives a restart.
    pub async fn load(db: &Database, persister: Persister) -> Self {
        let mut store = Self::new(persister);

        let saved_tabs = match db.get_value(TABS_KEY).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read saved tabs: {}", e);
                None
            }
        };
        let Some(saved_tabs) = saved_tabs else {
            return store;
        };

        let mut tabs: Vec<Tab> = match serde_json::from_str(&saved_tabs) {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!("Discarding unreadable saved tabs: {}", e);
                return store;
            }
        };
        for tab in &mut tabs {
            tab.is_loading = false;
        }

        let saved_selected = db.get_value(ACTIVE_TAB_KEY).await.unwrap_or_else(|e| {
            warn!("Failed to read saved tab selection: {}", e);
            None
        });

        store.selected = match saved_selected {
            Some(id) if tabs.iter().any(|t| t.id == id) => Some(id),
            _ => tabs.first().map(|t| t.id.clone()),
        };
        store.tabs = tabs;

        info!("Restored {} tabs", store.tabs.len());
        store
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn tab(&self, id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == id)
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected_tab(&self) -> Option<&Tab> {
        self.selected.as_deref().and_then(|id| self.tab(id))
    }

    pub fn set_notice(&mut self, notice: Notice) {
        self.notice = Some(notice);
    }

    pub fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    /// Append a loading tab for `url`, select it and persist right away.
    /// The caller is expected to start a refresh for the returned id.
    pub fn add_tab(&mut self, url: &str) -> TabId {
        let mut id = next_tab_id();
        while self.tab(&id).is_some() {
            id = next_tab_id();
        }

        self.tabs.push(Tab {
            id: id.clone(),
            title: NEW_TAB_TITLE.to_string(),
            url: url.to_string(),
            data: None,
            is_loading: true,
            last_good: None,
        });
        self.selected = Some(id.clone());

        self.persister.save_tabs(&self.tabs);
        self.persister.save_selected(&id);

        info!("Added tab {} for {}", id, url);
        id
    }

    /// Mark a tab as loading `url`. The current snapshot is held back and
    /// comes back if the refresh fails.
    pub fn begin_refresh(&mut self, id: &str, url: &str) -> Result<(), SessionError> {
        let tab = self
            .tabs
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| SessionError::UnknownTab(id.to_string()))?;

        tab.is_loading = true;
        tab.url = url.to_string();
        tab.last_good = tab.data.take().or(tab.last_good.take());

        self.persister.save_tabs(&self.tabs);
        Ok(())
    }

    /// Apply the result of a fetch started by [`begin_refresh`](Self::begin_refresh).
    ///
    /// Results are applied in the order they arrive. A result for a tab that
    /// no longer exists is dropped.
    pub fn complete_refresh(
        &mut self,
        id: &str,
        result: Result<FeedSnapshot, IngestError>,
    ) -> RefreshOutcome {
        let Some(tab) = self.tabs.iter_mut().find(|t| t.id == id) else {
            info!("Tab {} was removed before its refresh finished", id);
            return RefreshOutcome::Discarded;
        };

        tab.is_loading = false;
        let stashed = tab.last_good.take();

        let outcome = match result {
            Ok(snapshot) => {
                tab.title = if snapshot.feed_title.is_empty() {
                    DEFAULT_FEED_TITLE.to_string()
                } else {
                    snapshot.feed_title.clone()
                };
                let articles = snapshot.articles.len();
                tab.data = Some(snapshot);
                RefreshOutcome::Updated { articles }
            }
            Err(e) => {
                warn!("Refresh of tab {} ({}) failed: {}", id, tab.url, e);
                if tab.data.is_none() {
                    tab.data = stashed;
                }
                RefreshOutcome::Failed {
                    message: e.public_message(),
                }
            }
        };

        self.persister.save_tabs(&self.tabs);
        outcome
    }

    pub fn remove_tab(&mut self, id: &str) -> Result<(), SessionError> {
        if self.tabs.len() <= 1 {
            return Err(SessionError::LastTab);
        }

        let index = self
            .tabs
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| SessionError::UnknownTab(id.to_string()))?;
        self.tabs.remove(index);

        self.persister.save_tabs(&self.tabs);
        if self.selected.as_deref() == Some(id) {
            self.selected = self.tabs.first().map(|t| t.id.clone());
            if let Some(selected) = &self.selected {
                self.persister.save_selected(selected);
            }
        }

        info!("Removed tab {}", id);
        Ok(())
    }

    /// Point the selection at `id`. Only the selection is persisted.
    pub fn select_tab(&mut self, id: &str) -> Result<(), SessionError> {
        if self.tab(id).is_none() {
            return Err(SessionError::UnknownTab(id.to_string()));
        }

        self.selected = Some(id.to_string());
        self.persister.save_selected(id);
        Ok(())
    }

    pub fn clear_all(&mut self) {
        self.tabs.clear();
        self.selected = None;
        self.persister.clear();
        info!("Cleared all session data");
    }
}

/// Copy of the session handed to the page renderer.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub tabs: Vec<Tab>,
    pub selected: Option<TabId>,
    pub notice: Option<Notice>,
}

impl SessionView {
    pub fn selected_tab(&self) -> Option<&Tab> {
        let id = self.selected.as_deref()?;
        self.tabs.iter().find(|t| t.id == id)
    }
}

/// Shared handle over the session store and the ingestion service.
pub struct Session {
    store: Mutex<SessionStore>,
    ingestor: Arc<Ingestor>,
    persister: Persister,
}

impl Session {
    pub fn new(store: SessionStore, ingestor: Arc<Ingestor>) -> Self {
        let persister = store.persister.clone();
        Self {
            store: Mutex::new(store),
            ingestor,
            persister,
        }
    }

    /// Add a tab for `url` and load it.
    pub async fn add_tab(&self, url: &str) -> (TabId, RefreshOutcome) {
        let id = self.store.lock().await.add_tab(url);

        let outcome = match self.refresh_tab(&id, url).await {
            Ok(outcome) => outcome,
            Err(_) => RefreshOutcome::Discarded,
        };
        (id, outcome)
    }

    /// Reload tab `id` from `url`. Fails only if the tab does not exist when
    /// the refresh starts; fetch failures come back as an outcome.
    pub async fn refresh_tab(&self, id: &str, url: &str) -> Result<RefreshOutcome, SessionError> {
        self.store.lock().await.begin_refresh(id, url)?;

        let result = self.ingestor.fetch_feed(url).await;

        let mut store = self.store.lock().await;
        let outcome = store.complete_refresh(id, result);
        match &outcome {
            RefreshOutcome::Updated { articles } => {
                store.set_notice(Notice::success(format!("Feed loaded: {} articles", articles)));
            }
            RefreshOutcome::Failed { message } => {
                store.set_notice(Notice::error(format!("Failed to load feed: {}", message)));
            }
            RefreshOutcome::Discarded => {}
        }
        Ok(outcome)
    }

    pub async fn remove_tab(&self, id: &str) -> Result<(), SessionError> {
        let mut store = self.store.lock().await;
        let result = store.remove_tab(id);
        match &result {
            Ok(()) => store.set_notice(Notice::success("Removed tab")),
            Err(e) => store.set_notice(Notice::error(e.to_string())),
        }
        result
    }

    pub async fn select_tab(&self, id: &str) -> Result<(), SessionError> {
        self.store.lock().await.select_tab(id)
    }

    pub async fn clear_all(&self) {
        let mut store = self.store.lock().await;
        store.clear_all();
        store.set_notice(Notice::success("Cleared all data"));
    }

    pub async fn notify(&self, notice: Notice) {
        self.store.lock().await.set_notice(notice);
    }

    /// Url of tab `id`, if it exists.
    pub async fn tab_url(&self, id: &str) -> Option<String> {
        self.store.lock().await.tab(id).map(|t| t.url.clone())
    }

    /// Copy the current state and consume the pending notice.
    pub async fn view(&self) -> SessionView {
        let mut store = self.store.lock().await;
        SessionView {
            tabs: store.tabs().to_vec(),
            selected: store.selected().map(str::to_string),
            notice: store.take_notice(),
        }
    }

    pub async fn flush(&self) {
        self.persister.flush().await;
    }
}
