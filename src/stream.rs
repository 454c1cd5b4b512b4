//! One room's message list, kept in step with the store.
//!
//! Messages are ordered by `created_at` ascending, ties by the order they
//! reached local state. Nothing is shown optimistically: a sent message
//! appears once the store has accepted it, either from the insert result or
//! from its echo on the feed, whichever lands first. The other one is a no-op.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};

use crate::blobs::{attachment_path, BlobStore};
use crate::directory::{fetch_summary, RoomDirectory};
use crate::models::{
    from_rows, Attachment, ChatRoom, Message, MessageReaction, MessageType, Outgoing, Record,
    RoomParticipant,
};
use crate::permissions::{self, Capabilities};
use crate::reactions::ReactionAggregator;
use crate::store::{
    Backend, ChangeEvent, ChangeOp, FeedFilter, Filter, Query, RealtimeFeed, RemoteStore, Row,
    SubscriptionHandle, Table,
};
use crate::CoreError;

// ─── Ordered log ─────────────────────────────────────────────────────────────

type OrderKey = (i64, u64);

/// Messages keyed by id, iterated in `(created_at, arrival)` order.
#[derive(Debug, Default)]
struct MessageLog {
    by_id: HashMap<String, (OrderKey, Message)>,
    order: BTreeMap<OrderKey, String>,
    next_seq: u64,
}

impl MessageLog {
    /// Returns false, leaving the stored copy untouched, if the id is known.
    fn insert(&mut self, message: Message) -> bool {
        if self.by_id.contains_key(&message.id) {
            return false;
        }
        let key = (message.created_at, self.next_seq);
        self.next_seq += 1;
        self.order.insert(key, message.id.clone());
        self.by_id.insert(message.id.clone(), (key, message));
        true
    }

    fn remove(&mut self, id: &str) -> Option<Message> {
        let (key, message) = self.by_id.remove(id)?;
        self.order.remove(&key);
        Some(message)
    }

    fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id).map(|(_, m)| m)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.by_id.get_mut(id).map(|(_, m)| m)
    }

    fn iter(&self) -> impl Iterator<Item = &Message> {
        self.order.values().filter_map(|id| self.get(id))
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Effect of one feed event on the local list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Appended,
    Updated,
    Removed,
    Ignored,
}

/// Per-id result of a batch operation.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, CoreError)>,
}

impl BulkOutcome {
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ─── Stream ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct StreamState {
    room: Option<ChatRoom>,
    roster: Vec<RoomParticipant>,
    log: MessageLog,
}

struct Inner {
    room_id: String,
    actor_id: String,
    store: Arc<dyn RemoteStore>,
    feed: Arc<dyn RealtimeFeed>,
    blobs: Arc<dyn BlobStore>,
    reactions: ReactionAggregator,
    directory: Option<RoomDirectory>,
    state: Mutex<StreamState>,
    revision: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct MessageStream {
    inner: Arc<Inner>,
}

impl MessageStream {
    /// A stream for `room_id` seen by `actor_id`. When a directory is given,
    /// new messages bump the room's last activity there.
    pub fn new(
        room_id: &str,
        actor_id: &str,
        backend: &Backend,
        directory: Option<RoomDirectory>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                room_id: room_id.to_string(),
                actor_id: actor_id.to_string(),
                store: backend.store.clone(),
                feed: backend.feed.clone(),
                blobs: backend.blobs.clone(),
                reactions: ReactionAggregator::new(backend.store.clone()),
                directory,
                state: Mutex::new(StreamState::default()),
                revision,
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    /// Bumped on every change to local state.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }

    /// Fetch the room, its roster and its messages, then attach reactions.
    ///
    /// Fetched messages are merged with anything the feed already delivered.
    /// A failure loading reactions leaves the messages in place without them.
    pub async fn load(&self) -> Result<(), CoreError> {
        let room_id = self.room_id();
        let summary = fetch_summary(self.inner.store.as_ref(), room_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))?;

        let rows = self
            .inner
            .store
            .select(&Query::from(Table::Messages).eq("room_id", room_id).order("created_at", true))
            .await?;
        let messages: Vec<Message> = from_rows(&rows)?;
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();

        {
            let mut state = self.inner.state.lock().await;
            state.room = Some(summary.room);
            state.roster = summary.participants;
            for message in messages {
                state.log.insert(message);
            }
        }
        self.bump();
        log::debug!("loaded {} messages for room {room_id}", ids.len());

        match self.inner.reactions.fetch_many(&ids).await {
            Ok(by_message) => {
                let mut state = self.inner.state.lock().await;
                for (id, reactions) in by_message {
                    if let Some(message) = state.log.get_mut(&id) {
                        message.reactions = reactions;
                    }
                }
                drop(state);
                self.bump();
            }
            Err(e) => log::warn!("reactions for room {room_id} not loaded: {e}"),
        }
        Ok(())
    }

    /// Apply feed events for this room until the handle is dropped.
    pub async fn subscribe(&self) -> Result<SubscriptionHandle, CoreError> {
        let mut sub = self
            .inner
            .feed
            .subscribe(Table::Messages, FeedFilter::eq("room_id", self.room_id()))
            .await?;

        let stream = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                match stream.apply_change(&event).await {
                    Ok(applied) => log::debug!("room {} event {:?}: {applied:?}", stream.room_id(), event.op),
                    Err(e) => log::warn!("room {} event {:?} not applied: {e}", stream.room_id(), event.op),
                }
            }
        });
        Ok(SubscriptionHandle::new(task))
    }

    /// Merge one feed event into local state.
    ///
    /// Inserts are re-read from the store before they are appended since the
    /// pushed record may be incomplete.
    pub async fn apply_change(&self, event: &ChangeEvent) -> Result<Applied, CoreError> {
        if event.table != Table::Messages {
            return Ok(Applied::Ignored);
        }
        let Some(id) = event.field("id") else {
            return Ok(Applied::Ignored);
        };
        if event.field("room_id").is_some_and(|room| room != self.room_id()) {
            return Ok(Applied::Ignored);
        }

        match event.op {
            ChangeOp::Insert => {
                if self.inner.state.lock().await.log.get(id).is_some() {
                    return Ok(Applied::Ignored);
                }
                let Some(row) = self
                    .inner
                    .store
                    .select_one(&Query::from(Table::Messages).eq("id", id))
                    .await?
                else {
                    return Ok(Applied::Ignored);
                };
                let message = Message::from_row(&row)?;
                if message.room_id != self.room_id() {
                    return Ok(Applied::Ignored);
                }
                let created_at = message.created_at;
                if !self.append(message).await {
                    return Ok(Applied::Ignored);
                }
                self.touch_directory(created_at).await;
                Ok(Applied::Appended)
            }
            ChangeOp::Update => {
                let updated = match event.new_record.as_ref().map(Message::from_row) {
                    Some(Ok(message)) => message,
                    _ => match self
                        .inner
                        .store
                        .select_one(&Query::from(Table::Messages).eq("id", id))
                        .await?
                    {
                        Some(row) => Message::from_row(&row)?,
                        None => return Ok(Applied::Ignored),
                    },
                };
                let mut state = self.inner.state.lock().await;
                let Some(message) = state.log.get_mut(id) else {
                    return Ok(Applied::Ignored);
                };
                message.content = updated.content;
                message.edited_at = updated.edited_at;
                message.attachment = updated.attachment;
                drop(state);
                self.bump();
                Ok(Applied::Updated)
            }
            ChangeOp::Delete => {
                let removed = self.inner.state.lock().await.log.remove(id);
                if removed.is_none() {
                    return Ok(Applied::Ignored);
                }
                self.bump();
                Ok(Applied::Removed)
            }
        }
    }

    async fn append(&self, message: Message) -> bool {
        let inserted = self.inner.state.lock().await.log.insert(message);
        if inserted {
            self.bump();
        }
        inserted
    }

    async fn touch_directory(&self, at: i64) {
        if let Some(directory) = &self.inner.directory {
            directory.touch(self.room_id(), at).await;
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub async fn room(&self) -> Option<ChatRoom> {
        self.inner.state.lock().await.room.clone()
    }

    pub async fn roster(&self) -> Vec<RoomParticipant> {
        self.inner.state.lock().await.roster.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().await.log.iter().cloned().collect()
    }

    pub async fn message_ids(&self) -> Vec<String> {
        self.inner.state.lock().await.log.iter().map(|m| m.id.clone()).collect()
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        self.inner.state.lock().await.log.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The message `message` replies to, if it is loaded here.
    pub async fn reply_preview(&self, message: &Message) -> Option<Message> {
        let target = message.reply_to.as_deref()?;
        let state = self.inner.state.lock().await;
        state.log.get(target).filter(|m| m.room_id == message.room_id).cloned()
    }

    /// What the actor may do in this room. Base capabilities until loaded.
    pub async fn capabilities(&self) -> Capabilities {
        let state = self.inner.state.lock().await;
        match &state.room {
            Some(room) => permissions::evaluate(&self.inner.actor_id, room, &state.roster),
            None => Capabilities::BASE,
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    pub async fn send(&self, outgoing: Outgoing) -> Result<Message, CoreError> {
        let mut outgoing = normalize(outgoing)?;
        if let Some(target) = outgoing.reply_to.clone() {
            if !self.reply_target_exists(&target).await? {
                log::warn!("reply target {target} not found, sending without it");
                outgoing.reply_to = None;
            }
        }

        let row = outgoing.to_row(self.room_id(), &self.inner.actor_id);
        let stored = self.inner.store.insert_one(Table::Messages, row).await?;
        let message = Message::from_row(&stored)?;

        if self.append(message.clone()).await {
            self.touch_directory(message.created_at).await;
        }
        log::info!("sent {} message {} to room {}", message.message_type.as_str(), message.id, self.room_id());
        Ok(message)
    }

    /// Whether a reply target exists in this room. Targets in another room
    /// are rejected.
    async fn reply_target_exists(&self, target: &str) -> Result<bool, CoreError> {
        if self.inner.state.lock().await.log.get(target).is_some() {
            return Ok(true);
        }
        let Some(row) = self
            .inner
            .store
            .select_one(&Query::from(Table::Messages).eq("id", target))
            .await?
        else {
            return Ok(false);
        };
        match row.get("room_id").and_then(Value::as_str) {
            Some(room_id) if room_id == self.room_id() => Ok(true),
            _ => Err(CoreError::Validation("cannot reply to a message from another room".into())),
        }
    }

    /// Upload `bytes` and send them as an attachment named `file_name`.
    /// Nothing is sent if the upload fails.
    pub async fn send_attachment(&self, file_name: &str, bytes: &[u8]) -> Result<Message, CoreError> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(CoreError::Validation("attachment has no file name".into()));
        }
        if bytes.is_empty() {
            return Err(CoreError::Validation("attachment is empty".into()));
        }

        let path = attachment_path(&self.inner.actor_id, file_name, bytes);
        let handle = self.inner.blobs.upload(&path, bytes).await.map_err(|e| {
            log::warn!("upload of {file_name} failed: {e}");
            CoreError::from(e)
        })?;
        let attachment = Attachment {
            url: self.inner.blobs.public_url(&handle),
            name: Some(file_name.to_string()),
            size: i64::try_from(bytes.len()).ok(),
        };
        let kind = MessageType::for_file_name(file_name);
        self.send(Outgoing::with_attachment(kind, Some(file_name.to_string()), attachment)).await
    }

    pub async fn send_gif(&self, url: &str, title: &str) -> Result<Message, CoreError> {
        self.send(picked_media(MessageType::Gif, url, title)).await
    }

    pub async fn send_sticker(&self, url: &str, title: &str) -> Result<Message, CoreError> {
        self.send(picked_media(MessageType::Sticker, url, title)).await
    }

    /// Replace the content of one of the actor's own messages.
    pub async fn edit(&self, message_id: &str, new_content: &str) -> Result<Message, CoreError> {
        let content = new_content.trim();
        if content.is_empty() {
            return Err(CoreError::Validation("message is empty".into()));
        }
        {
            let state = self.inner.state.lock().await;
            let message = state
                .log
                .get(message_id)
                .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?;
            if !permissions::can_edit(&self.inner.actor_id, message) {
                return Err(CoreError::PermissionDenied("only the author can edit a message".into()));
            }
        }

        let mut changes = Row::new();
        changes.insert("content".into(), json!(content));
        changes.insert("edited_at".into(), json!(crate::now_micros()));
        let rows = self
            .inner
            .store
            .update(Table::Messages, &[Filter::eq("id", message_id)], changes)
            .await?;
        let updated = match rows.first() {
            Some(row) => Message::from_row(row)?,
            None => return Err(CoreError::NotFound(format!("message {message_id}"))),
        };

        let mut state = self.inner.state.lock().await;
        // Removed locally while the update was in flight; the remote edit stands.
        let Some(message) = state.log.get_mut(message_id) else {
            log::debug!("edited message {message_id} no longer loaded");
            return Ok(updated);
        };
        message.content = updated.content;
        message.edited_at = updated.edited_at;
        let result = message.clone();
        drop(state);
        self.bump();
        Ok(result)
    }

    pub async fn delete(&self, message_id: &str) -> Result<(), CoreError> {
        let mut outcome = self.delete_many(&[message_id.to_string()]).await;
        match outcome.failed.pop() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete each message independently. Permission is checked for every id
    /// before any delete is issued; each id leaves local state only if its
    /// own delete succeeded.
    pub async fn delete_many(&self, message_ids: &[String]) -> BulkOutcome {
        let caps = self.capabilities().await;
        let mut outcome = BulkOutcome::default();
        let mut allowed = Vec::new();
        {
            let state = self.inner.state.lock().await;
            let mut seen = HashSet::new();
            for id in message_ids.iter().filter(|id| seen.insert(id.as_str())) {
                match state.log.get(id) {
                    None => outcome.failed.push((id.clone(), CoreError::NotFound(format!("message {id}")))),
                    Some(m) if !permissions::can_delete(&self.inner.actor_id, caps, m) => {
                        outcome.failed.push((
                            id.clone(),
                            CoreError::PermissionDenied("not allowed to delete this message".into()),
                        ));
                    }
                    Some(_) => allowed.push(id.clone()),
                }
            }
        }

        let store = &self.inner.store;
        let results = join_all(allowed.iter().map(|id| async move {
            (id, store.delete(Table::Messages, &[Filter::eq("id", id.as_str())]).await)
        }))
        .await;

        let mut state = self.inner.state.lock().await;
        for (id, result) in results {
            match result {
                Ok(_) => {
                    state.log.remove(id);
                    outcome.succeeded.push(id.clone());
                }
                Err(e) => outcome.failed.push((id.clone(), e.into())),
            }
        }
        drop(state);

        if !outcome.succeeded.is_empty() {
            self.bump();
        }
        if !outcome.is_complete() {
            log::warn!(
                "room {}: deleted {} of {} messages",
                self.room_id(),
                outcome.succeeded_count(),
                outcome.succeeded_count() + outcome.failed_count()
            );
        }
        outcome
    }

    /// Toggle the actor's `emoji` on a message and return its new reactions.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<Vec<MessageReaction>, CoreError> {
        let current = self
            .message(message_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?
            .reactions;
        let next = self
            .inner
            .reactions
            .toggle(&current, message_id, &self.inner.actor_id, emoji)
            .await?;

        if let Some(message) = self.inner.state.lock().await.log.get_mut(message_id) {
            message.reactions = next.clone();
        }
        self.bump();
        Ok(next)
    }
}

/// Trim content and check the message has something to show.
fn normalize(mut outgoing: Outgoing) -> Result<Outgoing, CoreError> {
    outgoing.content = outgoing
        .content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    if let Some(attachment) = &outgoing.attachment {
        if attachment.url.trim().is_empty() {
            return Err(CoreError::Validation("attachment has no url".into()));
        }
    }
    match outgoing.message_type {
        MessageType::Text if outgoing.content.is_none() => {
            Err(CoreError::Validation("message is empty".into()))
        }
        MessageType::Text => Ok(outgoing),
        _ if outgoing.attachment.is_none() => {
            Err(CoreError::Validation(format!("{} message without attachment", outgoing.message_type.as_str())))
        }
        _ => Ok(outgoing),
    }
}

fn picked_media(kind: MessageType, url: &str, title: &str) -> Outgoing {
    let title = title.trim();
    let name = (!title.is_empty()).then(|| title.to_string());
    Outgoing::with_attachment(
        kind,
        name.clone(),
        Attachment { url: url.trim().to_string(), name, size: None },
    )
}
