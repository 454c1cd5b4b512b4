//! Remote store and change feed interfaces, plus [`bootstrap`] which wires
//! the local SQLite implementation and blob directory into a [`Backend`].
//!
//! Both interfaces are request/response over JSON rows. Any transport that
//! satisfies them (a hosted Postgres gateway, the local [`SqliteStore`]) is
//! interchangeable.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::blobs::{BlobStore, LocalBlobStore};
use crate::config::EngineConfig;
use crate::db::SqliteStore;

/// One record as a column → value map.
pub type Row = serde_json::Map<String, Value>;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store init error: {0}")]
    Init(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("subscription closed")]
    Closed,
}

// ─── Tables ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Profiles,
    ChatRooms,
    RoomParticipants,
    Messages,
    MessageReactions,
}

impl Table {
    pub const ALL: &'static [Table] = &[
        Table::Profiles,
        Table::ChatRooms,
        Table::RoomParticipants,
        Table::Messages,
        Table::MessageReactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::ChatRooms => "chat_rooms",
            Table::RoomParticipants => "room_participants",
            Table::Messages => "messages",
            Table::MessageReactions => "message_reactions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Neq(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    /// Case-insensitive `LIKE` with `%`/`_` wildcards.
    ILike(String, String),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn in_list<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A filtered read: `select * from table where .. order by .. limit ..`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn from(table: Table) -> Self {
        Self { table, filters: Vec::new(), order: Vec::new(), limit: None }
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn neq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Neq(column.to_string(), value.into()));
        self
    }

    pub fn in_list<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.filters.push(Filter::in_list(column, values));
        self
    }

    pub fn not_in<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.filters
            .push(Filter::NotIn(column.to_string(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn ilike(mut self, column: &str, pattern: impl Into<String>) -> Self {
        self.filters.push(Filter::ILike(column.to_string(), pattern.into()));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order { column: column.to_string(), ascending });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ─── Remote store ────────────────────────────────────────────────────────────

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Insert every row (all or nothing) and return them as stored.
    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError>;

    /// Apply `changes` to every matching row and return the updated rows.
    async fn update(&self, table: Table, filters: &[Filter], changes: Row)
        -> Result<Vec<Row>, StoreError>;

    /// Delete every matching row and return what was deleted.
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError>;

    async fn select_one(&self, query: &Query) -> Result<Option<Row>, StoreError> {
        let mut rows = self.select(&query.clone().limit(1)).await?;
        Ok(rows.pop())
    }

    async fn insert_one(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        self.insert(table, vec![row])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Request(format!("insert into {table} returned no row")))
    }
}

// ─── Realtime feed ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
    pub new_record: Option<Row>,
    pub old_record: Option<Row>,
}

impl ChangeEvent {
    /// The record the event is about: new for inserts/updates, old for deletes.
    pub fn record(&self) -> Option<&Row> {
        match self.op {
            ChangeOp::Delete => self.old_record.as_ref().or(self.new_record.as_ref()),
            _ => self.new_record.as_ref().or(self.old_record.as_ref()),
        }
    }

    pub fn field(&self, column: &str) -> Option<&str> {
        self.record()?.get(column)?.as_str()
    }
}

/// Server-side equality scope for a subscription (`column = value`).
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFilter {
    pub column: String,
    pub value: Value,
}

impl FeedFilter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self { column: column.to_string(), value: value.into() }
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column) == Some(&self.value)
    }
}

#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    async fn subscribe(&self, table: Table, filter: FeedFilter) -> Result<Subscription, StoreError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// A live feed subscription. Delivery stops when it is unsubscribed or
/// dropped.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>, release: ReleaseFn) -> Self {
        Self { events, release: Some(release) }
    }

    /// Next event, or `None` once the feed side has gone away.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("released", &self.release.is_none()).finish()
    }
}

/// Owned handle for a task pumping a [`Subscription`] into local state.
///
/// Dropping the handle (or calling [`cancel`](Self::cancel)) stops the task,
/// which drops the subscription and releases it on the feed.
#[derive(Debug)]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn cancel(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─── Backend bundle ──────────────────────────────────────────────────────────

/// The collaborators the engine talks to.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn RemoteStore>,
    pub feed: Arc<dyn RealtimeFeed>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Backend {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        feed: Arc<dyn RealtimeFeed>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self { store, feed, blobs }
    }
}

/// Open the local SQLite store, apply its schema and prepare the blob
/// directory.
pub async fn bootstrap(config: &EngineConfig) -> Result<Backend, StoreError> {
    let sqlite = Arc::new(
        SqliteStore::open(&config.database_url)
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?,
    );

    tokio::fs::create_dir_all(&config.blob_dir)
        .await
        .map_err(|e| StoreError::Init(format!("failed to create blob directory: {e}")))?;
    let blobs = Arc::new(LocalBlobStore::new(&config.blob_dir, &config.public_base_url));

    log::info!("backend ready: database {}, blobs in {}", config.database_url, config.blob_dir.display());

    Ok(Backend::new(sqlite.clone(), sqlite, blobs))
}
