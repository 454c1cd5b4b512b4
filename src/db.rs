//! Local store: SQLite tables behind the [`RemoteStore`] and
//! [`RealtimeFeed`] interfaces.
//!
//! Filters are translated to parameterised SQL against a fixed column list
//! per table. Every committed write is fanned out to live subscriptions whose
//! equality filter matches the affected record, which is how the engine sees
//! its own echoes when running against this store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::store::{
    ChangeEvent, ChangeOp, FeedFilter, Filter, Order, Query, RealtimeFeed, RemoteStore, Row,
    StoreError, Subscription, Table,
};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Schema ──────────────────────────────────────────────────────────────────

/// Create all tables if they don't already exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL,
            avatar_url      TEXT,
            status          TEXT NOT NULL DEFAULT 'offline',
            last_seen       INTEGER NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chat_rooms (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            description     TEXT,
            avatar_url      TEXT,
            is_group        INTEGER NOT NULL DEFAULT 0,
            created_by      TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS room_participants (
            id              TEXT PRIMARY KEY,
            room_id         TEXT NOT NULL REFERENCES chat_rooms(id),
            user_id         TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'member',
            joined_at       INTEGER NOT NULL,
            UNIQUE (room_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            room_id         TEXT NOT NULL REFERENCES chat_rooms(id),
            user_id         TEXT NOT NULL,
            content         TEXT,
            message_type    TEXT NOT NULL DEFAULT 'text',
            file_url        TEXT,
            file_name       TEXT,
            file_size       INTEGER,
            reply_to        TEXT,
            edited_at       INTEGER,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS message_reactions (
            id              TEXT PRIMARY KEY,
            message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL,
            reaction        TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            UNIQUE (message_id, user_id, reaction)
        );

        CREATE INDEX IF NOT EXISTS messages_room_created ON messages (room_id, created_at);
        CREATE INDEX IF NOT EXISTS participants_user ON room_participants (user_id);

        -- Last activity only moves forward.
        CREATE TRIGGER IF NOT EXISTS messages_touch_room
        AFTER INSERT ON messages
        BEGIN
            UPDATE chat_rooms SET updated_at = NEW.created_at
            WHERE id = NEW.room_id AND updated_at < NEW.created_at;
        END;
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Integer,
    Bool,
}

fn columns(table: Table) -> &'static [(&'static str, Kind)] {
    use Kind::{Bool, Integer, Text};
    match table {
        Table::Profiles => &[
            ("id", Text),
            ("username", Text),
            ("avatar_url", Text),
            ("status", Text),
            ("last_seen", Integer),
            ("created_at", Integer),
            ("updated_at", Integer),
        ],
        Table::ChatRooms => &[
            ("id", Text),
            ("name", Text),
            ("description", Text),
            ("avatar_url", Text),
            ("is_group", Bool),
            ("created_by", Text),
            ("created_at", Integer),
            ("updated_at", Integer),
        ],
        Table::RoomParticipants => &[
            ("id", Text),
            ("room_id", Text),
            ("user_id", Text),
            ("role", Text),
            ("joined_at", Integer),
        ],
        Table::Messages => &[
            ("id", Text),
            ("room_id", Text),
            ("user_id", Text),
            ("content", Text),
            ("message_type", Text),
            ("file_url", Text),
            ("file_name", Text),
            ("file_size", Integer),
            ("reply_to", Text),
            ("edited_at", Integer),
            ("created_at", Integer),
        ],
        Table::MessageReactions => &[
            ("id", Text),
            ("message_id", Text),
            ("user_id", Text),
            ("reaction", Text),
            ("created_at", Integer),
        ],
    }
}

/// Columns stamped with the store clock when an insert leaves them empty.
fn timestamp_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Profiles => &["last_seen", "created_at", "updated_at"],
        Table::ChatRooms => &["created_at", "updated_at"],
        Table::RoomParticipants => &["joined_at"],
        Table::Messages | Table::MessageReactions => &["created_at"],
    }
}

fn check_column(table: Table, column: &str) -> Result<Kind, StoreError> {
    columns(table)
        .iter()
        .find(|(name, _)| *name == column)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| StoreError::Request(format!("unknown column {table}.{column}")))
}

// ─── SQL building ────────────────────────────────────────────────────────────

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(q: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => q.bind(None::<String>),
        Value::Bool(b) => q.bind(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => q.bind(i),
            None => q.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => q.bind(s.clone()),
        other => q.bind(other.to_string()),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn where_clause(table: Table, filters: &[Filter]) -> Result<(String, Vec<Value>), StoreError> {
    let mut parts = Vec::with_capacity(filters.len());
    let mut binds = Vec::new();

    for filter in filters {
        match filter {
            Filter::Eq(col, Value::Null) => {
                check_column(table, col)?;
                parts.push(format!("{col} IS NULL"));
            }
            Filter::Eq(col, value) => {
                check_column(table, col)?;
                parts.push(format!("{col} = ?"));
                binds.push(value.clone());
            }
            Filter::Neq(col, Value::Null) => {
                check_column(table, col)?;
                parts.push(format!("{col} IS NOT NULL"));
            }
            Filter::Neq(col, value) => {
                check_column(table, col)?;
                parts.push(format!("{col} <> ?"));
                binds.push(value.clone());
            }
            Filter::In(col, values) => {
                check_column(table, col)?;
                if values.is_empty() {
                    parts.push("0".to_string());
                } else {
                    parts.push(format!("{col} IN ({})", placeholders(values.len())));
                    binds.extend(values.iter().cloned());
                }
            }
            Filter::NotIn(col, values) => {
                check_column(table, col)?;
                if !values.is_empty() {
                    parts.push(format!("{col} NOT IN ({})", placeholders(values.len())));
                    binds.extend(values.iter().cloned());
                }
            }
            Filter::ILike(col, pattern) => {
                check_column(table, col)?;
                parts.push(format!("{col} LIKE ?"));
                binds.push(Value::String(pattern.clone()));
            }
        }
    }

    if parts.is_empty() {
        Ok((String::new(), binds))
    } else {
        Ok((format!(" WHERE {}", parts.join(" AND ")), binds))
    }
}

fn order_clause(table: Table, order: &[Order]) -> Result<String, StoreError> {
    let mut parts = Vec::with_capacity(order.len() + 1);
    for o in order {
        check_column(table, &o.column)?;
        parts.push(format!("{} {}", o.column, if o.ascending { "ASC" } else { "DESC" }));
    }
    // Ties fall back to insertion order.
    parts.push("rowid ASC".to_string());
    Ok(format!(" ORDER BY {}", parts.join(", ")))
}

fn decode_row(table: Table, row: &SqliteRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for &(name, kind) in columns(table) {
        let value = match kind {
            Kind::Text => row.try_get::<Option<String>, _>(name).map(|v| v.map(Value::from)),
            Kind::Integer => row.try_get::<Option<i64>, _>(name).map(|v| v.map(Value::from)),
            Kind::Bool => row
                .try_get::<Option<i64>, _>(name)
                .map(|v| v.map(|n| Value::Bool(n != 0))),
        }
        .map_err(|e| StoreError::Decode(format!("{table}.{name}: {e}")))?;
        out.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    Ok(out)
}

fn request_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.message().to_string());
        }
        if db.is_foreign_key_violation() {
            return StoreError::Request(format!("foreign key violation: {}", db.message()));
        }
    }
    StoreError::Request(e.to_string())
}

async fn fetch(
    conn: &mut SqliteConnection,
    table: Table,
    filters: &[Filter],
    order: &[Order],
    limit: Option<u32>,
) -> Result<Vec<Row>, StoreError> {
    let (where_sql, binds) = where_clause(table, filters)?;
    let order_sql = order_clause(table, order)?;
    let limit_sql = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
    let sql = format!("SELECT * FROM {table}{where_sql}{order_sql}{limit_sql}");

    let mut q = sqlx::query(&sql);
    for value in &binds {
        q = bind_value(q, value);
    }
    let rows = q.fetch_all(&mut *conn).await.map_err(request_error)?;
    rows.iter().map(|r| decode_row(table, r)).collect()
}

fn ids_of(rows: &[Row]) -> Vec<Value> {
    rows.iter().filter_map(|r| r.get("id").cloned()).collect()
}

// ─── Change fan-out ──────────────────────────────────────────────────────────

struct Subscriber {
    table: Table,
    filter: FeedFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct FeedHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl FeedHub {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(self: &Arc<Self>, table: Table, filter: FeedFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().insert(id, Subscriber { table, filter, tx });

        let hub = Arc::downgrade(self);
        Subscription::new(
            rx,
            Box::new(move || {
                if let Some(hub) = hub.upgrade() {
                    hub.subscribers().remove(&id);
                }
            }),
        )
    }

    fn publish(&self, event: ChangeEvent) {
        let Some(record) = event.record() else { return };
        self.subscribers().retain(|_, sub| {
            if sub.table != event.table || !sub.filter.matches(record) {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct SqliteStore {
    pool: SqlitePool,
    clock: AtomicI64,
    hub: Arc<FeedHub>,
}

impl SqliteStore {
    /// Connect to `url` and apply the schema.
    ///
    /// In-memory databases are private to one connection, so they get a
    /// single pooled connection that is never recycled.
    pub async fn open(url: &str) -> Result<Self, DbError> {
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(url)
                .await?
        } else {
            SqlitePoolOptions::new().max_connections(5).connect(url).await?
        };
        run_migrations(&pool).await?;
        Ok(Self::with_pool(pool))
    }

    /// Wrap an already migrated pool.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool, clock: AtomicI64::new(0), hub: Arc::new(FeedHub::default()) }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of live feed subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscribers().len()
    }

    /// Strictly increasing microsecond clock.
    fn next_timestamp(&self) -> i64 {
        let now = crate::now_micros();
        let prev = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }

    fn prepare_insert(&self, table: Table, mut row: Row) -> Result<Row, StoreError> {
        for col in row.keys() {
            check_column(table, col)?;
        }
        if row.get("id").map_or(true, Value::is_null) {
            row.insert("id".into(), Value::from(Uuid::new_v4().to_string()));
        }
        let ts = self.next_timestamp();
        for col in timestamp_columns(table) {
            if row.get(*col).map_or(true, Value::is_null) {
                row.insert((*col).to_string(), Value::from(ts));
            }
        }
        Ok(row)
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(request_error)?;
        fetch(&mut conn, query.table, &query.filters, &query.order, query.limit).await
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let prepared = rows
            .into_iter()
            .map(|r| self.prepare_insert(table, r))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await.map_err(request_error)?;
        for row in &prepared {
            let cols: Vec<&str> = row.keys().map(String::as_str).collect();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                cols.join(", "),
                placeholders(cols.len())
            );
            let mut q = sqlx::query(&sql);
            for value in row.values() {
                q = bind_value(q, value);
            }
            q.execute(&mut *tx).await.map_err(request_error)?;
        }
        let id_filter = [Filter::In("id".into(), ids_of(&prepared))];
        let stored = fetch(&mut tx, table, &id_filter, &[], None).await?;
        tx.commit().await.map_err(request_error)?;

        for row in &stored {
            self.hub.publish(ChangeEvent {
                table,
                op: ChangeOp::Insert,
                new_record: Some(row.clone()),
                old_record: None,
            });
        }
        Ok(stored)
    }

    async fn update(
        &self,
        table: Table,
        filters: &[Filter],
        changes: Row,
    ) -> Result<Vec<Row>, StoreError> {
        if changes.is_empty() {
            return Err(StoreError::Request(format!("empty update on {table}")));
        }
        for col in changes.keys() {
            check_column(table, col)?;
            if col == "id" {
                return Err(StoreError::Request("ids are immutable".into()));
            }
        }

        let mut tx = self.pool.begin().await.map_err(request_error)?;
        let old = fetch(&mut tx, table, filters, &[], None).await?;
        if old.is_empty() {
            return Ok(Vec::new());
        }

        let id_filter = [Filter::In("id".into(), ids_of(&old))];
        let (where_sql, binds) = where_clause(table, &id_filter)?;
        let set_sql = changes.keys().map(|c| format!("{c} = ?")).collect::<Vec<_>>().join(", ");
        let sql = format!("UPDATE {table} SET {set_sql}{where_sql}");
        let mut q = sqlx::query(&sql);
        for value in changes.values().chain(binds.iter()) {
            q = bind_value(q, value);
        }
        q.execute(&mut *tx).await.map_err(request_error)?;

        let new = fetch(&mut tx, table, &id_filter, &[], None).await?;
        tx.commit().await.map_err(request_error)?;

        for row in &new {
            let previous = old.iter().find(|o| o.get("id") == row.get("id")).cloned();
            self.hub.publish(ChangeEvent {
                table,
                op: ChangeOp::Update,
                new_record: Some(row.clone()),
                old_record: previous,
            });
        }
        Ok(new)
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Row>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(request_error)?;
        let old = fetch(&mut tx, table, filters, &[], None).await?;
        if old.is_empty() {
            return Ok(Vec::new());
        }

        let (where_sql, binds) = where_clause(table, &[Filter::In("id".into(), ids_of(&old))])?;
        let sql = format!("DELETE FROM {table}{where_sql}");
        let mut q = sqlx::query(&sql);
        for value in &binds {
            q = bind_value(q, value);
        }
        q.execute(&mut *tx).await.map_err(request_error)?;
        tx.commit().await.map_err(request_error)?;

        for row in &old {
            self.hub.publish(ChangeEvent {
                table,
                op: ChangeOp::Delete,
                new_record: None,
                old_record: Some(row.clone()),
            });
        }
        Ok(old)
    }
}

#[async_trait]
impl RealtimeFeed for SqliteStore {
    async fn subscribe(&self, table: Table, filter: FeedFilter) -> Result<Subscription, StoreError> {
        check_column(table, &filter.column)?;
        log::debug!("feed subscribe {table} where {} = {}", filter.column, filter.value);
        Ok(self.hub.register(table, filter))
    }
}
