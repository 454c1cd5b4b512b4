//! Fixtures shared by the unit tests.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::blobs::{BlobError, BlobHandle, BlobStore};
use crate::db::SqliteStore;
use crate::models::{
    new_participant_row, new_room_row, ChatRoom, Message, PresenceStatus, Profile, Record, Role,
};
use crate::store::{Backend, Filter, Query, RemoteStore, Row, StoreError, Table};

pub(crate) fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

pub(crate) async fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open("sqlite::memory:").await.unwrap())
}

pub(crate) fn profile(id: &str, username: &str) -> Profile {
    Profile {
        id: id.into(),
        username: username.into(),
        avatar_url: None,
        status: PresenceStatus::Online,
        last_seen: 0,
        created_at: 0,
        updated_at: 0,
    }
}

pub(crate) async fn seed_profile(store: &SqliteStore, id: &str, username: &str) -> Profile {
    let row = store
        .insert_one(Table::Profiles, row(json!({ "id": id, "username": username, "status": "online" })))
        .await
        .unwrap();
    Profile::from_row(&row).unwrap()
}

/// A room created by `created_by` with the given roster.
pub(crate) async fn seed_room(
    store: &SqliteStore,
    created_by: &str,
    is_group: bool,
    members: &[(&str, Role)],
) -> ChatRoom {
    let row = store
        .insert_one(Table::ChatRooms, new_room_row("room", None, is_group, created_by))
        .await
        .unwrap();
    let room = ChatRoom::from_row(&row).unwrap();
    let rows = members.iter().map(|(user, role)| new_participant_row(&room.id, user, *role)).collect();
    store.insert(Table::RoomParticipants, rows).await.unwrap();
    room
}

pub(crate) async fn seed_message(store: &SqliteStore, room_id: &str, author: &str, content: &str) -> Message {
    let row = store
        .insert_one(
            Table::Messages,
            row(json!({ "room_id": room_id, "user_id": author, "content": content, "message_type": "text" })),
        )
        .await
        .unwrap();
    Message::from_row(&row).unwrap()
}

pub(crate) fn backend(store: Arc<SqliteStore>) -> Backend {
    Backend::new(store.clone(), store, Arc::new(MemoryBlobs::default()))
}

/// Poll `check` until it holds or about a second has passed.
pub(crate) async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ─── Blob store ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MemoryBlobs {
    pub fail: bool,
    pub uploads: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<BlobHandle, BlobError> {
        if self.fail {
            return Err(BlobError::Rejected("quota exceeded".into()));
        }
        self.uploads.lock().unwrap().push((path.to_string(), bytes.len()));
        Ok(BlobHandle { path: path.to_string() })
    }

    fn public_url(&self, handle: &BlobHandle) -> String {
        format!("https://blobs.test/{}", handle.path)
    }
}

// ─── Failure injection ───────────────────────────────────────────────────────

/// Wraps a store and fails writes touching chosen rooms or row ids, and
/// reads of chosen tables. Counts every write call that reaches it.
pub(crate) struct FailingStore {
    inner: Arc<SqliteStore>,
    fail_rooms: Mutex<HashSet<String>>,
    fail_ids: Mutex<HashSet<String>>,
    fail_reads: Mutex<HashSet<Table>>,
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_rooms: Mutex::new(HashSet::new()),
            fail_ids: Mutex::new(HashSet::new()),
            fail_reads: Mutex::new(HashSet::new()),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_room(&self, room_id: &str) {
        self.fail_rooms.lock().unwrap().insert(room_id.to_string());
    }

    pub fn fail_id(&self, id: &str) {
        self.fail_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_reads(&self, table: Table) {
        self.fail_reads.lock().unwrap().insert(table);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn targets_failing_id(&self, filters: &[Filter]) -> bool {
        let ids = self.fail_ids.lock().unwrap();
        filters.iter().any(|f| match f {
            Filter::Eq(col, Value::String(v)) if col == "id" => ids.contains(v),
            Filter::In(col, vs) if col == "id" => {
                vs.iter().any(|v| v.as_str().is_some_and(|v| ids.contains(v)))
            }
            _ => false,
        })
    }
}

#[async_trait]
impl RemoteStore for FailingStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        if self.fail_reads.lock().unwrap().contains(&query.table) {
            return Err(StoreError::Request("injected read failure".into()));
        }
        self.inner.select(query).await
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let blocked = {
            let rooms = self.fail_rooms.lock().unwrap();
            rows.iter()
                .any(|r| r.get("room_id").and_then(Value::as_str).is_some_and(|id| rooms.contains(id)))
        };
        if blocked {
            return Err(StoreError::Request("injected insert failure".into()));
        }
        self.inner.insert(table, rows).await
    }

    async fn update(&self, table: Table, filters: &[Filter], changes: Row) -> Result<Vec<Row>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.targets_failing_id(filters) {
            return Err(StoreError::Request("injected update failure".into()));
        }
        self.inner.update(table, filters, changes).await
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.targets_failing_id(filters) {
            return Err(StoreError::Request("injected delete failure".into()));
        }
        self.inner.delete(table, filters).await
    }
}

/// Wraps a store and delays every read and update, counting room reads.
pub(crate) struct SlowStore {
    inner: Arc<SqliteStore>,
    delay: Duration,
    room_reads: AtomicUsize,
}

impl SlowStore {
    pub fn new(inner: Arc<SqliteStore>, delay: Duration) -> Self {
        Self { inner, delay, room_reads: AtomicUsize::new(0) }
    }

    pub fn room_reads(&self) -> usize {
        self.room_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for SlowStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        if query.table == Table::ChatRooms {
            self.room_reads.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        self.inner.select(query).await
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        self.inner.insert(table, rows).await
    }

    async fn update(&self, table: Table, filters: &[Filter], changes: Row) -> Result<Vec<Row>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(table, filters, changes).await
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError> {
        self.inner.delete(table, filters).await
    }
}
