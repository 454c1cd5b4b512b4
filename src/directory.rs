//! The rooms the signed-in user belongs to, most recent activity first.
//!
//! The list is filled by [`RoomDirectory::refresh`] and then kept current from
//! participant inserts for the actor. A bare participant event only carries ids,
//! so the room and its roster are fetched before the entry appears; at most one
//! such fetch runs per room id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::models::{from_rows, ChatRoom, Record, RoomParticipant, RoomSummary};
use crate::store::{
    ChangeEvent, ChangeOp, FeedFilter, Query, RealtimeFeed, RemoteStore, SubscriptionHandle, Table,
};
use crate::CoreError;

/// What a participant-added event did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantOutcome {
    Inserted,
    AlreadyPresent,
    /// Another event for the same room is still being hydrated.
    InFlight,
    /// Not an insert of the actor's own participant row.
    Ignored,
    /// The room no longer exists.
    Missing,
}

#[derive(Default)]
struct DirectoryState {
    rooms: Vec<RoomSummary>,
    in_flight: HashSet<String>,
}

struct Inner {
    actor_id: String,
    store: Arc<dyn RemoteStore>,
    feed: Arc<dyn RealtimeFeed>,
    state: Mutex<DirectoryState>,
}

#[derive(Clone)]
pub struct RoomDirectory {
    inner: Arc<Inner>,
}

impl RoomDirectory {
    pub fn new(actor_id: &str, store: Arc<dyn RemoteStore>, feed: Arc<dyn RealtimeFeed>) -> Self {
        Self {
            inner: Arc::new(Inner {
                actor_id: actor_id.to_string(),
                store,
                feed,
                state: Mutex::new(DirectoryState::default()),
            }),
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.inner.actor_id
    }

    /// Rebuild the list from the store.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let rows = self
            .inner
            .store
            .select(&Query::from(Table::RoomParticipants).eq("user_id", self.actor_id()))
            .await?;
        let mine: Vec<RoomParticipant> = from_rows(&rows)?;
        let room_ids: Vec<&str> = mine.iter().map(|p| p.room_id.as_str()).collect();
        let mut rooms = fetch_summaries(self.inner.store.as_ref(), &room_ids).await?;
        sort_by_activity(&mut rooms);

        log::debug!("directory for {}: {} rooms", self.actor_id(), rooms.len());
        self.inner.state.lock().await.rooms = rooms;
        Ok(())
    }

    pub async fn list(&self) -> Vec<RoomSummary> {
        self.inner.state.lock().await.rooms.clone()
    }

    pub async fn get(&self, room_id: &str) -> Option<RoomSummary> {
        self.inner.state.lock().await.rooms.iter().find(|r| r.id() == room_id).cloned()
    }

    /// Rooms whose name contains `term`, ignoring case. A blank term matches
    /// everything.
    pub async fn search(&self, term: &str) -> Vec<RoomSummary> {
        let needle = term.trim().to_lowercase();
        let state = self.inner.state.lock().await;
        state
            .rooms
            .iter()
            .filter(|r| needle.is_empty() || r.room.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Apply a participant-insert event from the feed.
    ///
    /// The room is only listed once its record and roster have been fetched.
    pub async fn on_participant_added(&self, event: &ChangeEvent) -> Result<ParticipantOutcome, CoreError> {
        if event.table != Table::RoomParticipants
            || event.op != ChangeOp::Insert
            || event.field("user_id") != Some(self.actor_id())
        {
            return Ok(ParticipantOutcome::Ignored);
        }
        let Some(room_id) = event.field("room_id").map(str::to_string) else {
            return Ok(ParticipantOutcome::Ignored);
        };

        {
            let mut state = self.inner.state.lock().await;
            if state.rooms.iter().any(|r| r.id() == room_id) {
                return Ok(ParticipantOutcome::AlreadyPresent);
            }
            if !state.in_flight.insert(room_id.clone()) {
                log::debug!("room {room_id} already hydrating, event dropped");
                return Ok(ParticipantOutcome::InFlight);
            }
        }

        let fetched = fetch_summary(self.inner.store.as_ref(), &room_id).await;

        let mut state = self.inner.state.lock().await;
        state.in_flight.remove(&room_id);
        match fetched {
            Err(e) => {
                log::warn!("failed to hydrate room {room_id}: {e}");
                Err(e)
            }
            Ok(None) => Ok(ParticipantOutcome::Missing),
            Ok(Some(_)) if state.rooms.iter().any(|r| r.id() == room_id) => {
                Ok(ParticipantOutcome::AlreadyPresent)
            }
            Ok(Some(summary)) => {
                log::debug!("joined room {room_id}");
                state.rooms.insert(0, summary);
                Ok(ParticipantOutcome::Inserted)
            }
        }
    }

    /// Follow participant changes for the actor until the handle is dropped.
    pub async fn subscribe(&self) -> Result<SubscriptionHandle, CoreError> {
        let mut sub = self
            .inner
            .feed
            .subscribe(Table::RoomParticipants, FeedFilter::eq("user_id", self.actor_id()))
            .await?;

        let directory = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                match event.op {
                    ChangeOp::Insert => {
                        if let Err(e) = directory.on_participant_added(&event).await {
                            log::warn!("participant event not applied: {e}");
                        }
                    }
                    ChangeOp::Delete => {
                        if let Some(room_id) = event.field("room_id") {
                            directory.remove(room_id).await;
                        }
                    }
                    ChangeOp::Update => {
                        if let Some(room_id) = event.field("room_id") {
                            directory.reload(room_id).await;
                        }
                    }
                }
            }
        });
        Ok(SubscriptionHandle::new(task))
    }

    /// Bump a room's last activity. Never moves it backwards.
    pub async fn touch(&self, room_id: &str, at: i64) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(summary) = state.rooms.iter_mut().find(|r| r.id() == room_id) else {
            return false;
        };
        if at <= summary.last_activity {
            return false;
        }
        summary.last_activity = at;
        sort_by_activity(&mut state.rooms);
        true
    }

    pub async fn remove(&self, room_id: &str) -> Option<RoomSummary> {
        let mut state = self.inner.state.lock().await;
        let pos = state.rooms.iter().position(|r| r.id() == room_id)?;
        Some(state.rooms.remove(pos))
    }

    /// Insert or replace one entry, keeping the order.
    pub async fn upsert(&self, summary: RoomSummary) {
        let mut state = self.inner.state.lock().await;
        match state.rooms.iter_mut().find(|r| r.id() == summary.id()) {
            Some(existing) => {
                let last_activity = existing.last_activity.max(summary.last_activity);
                *existing = RoomSummary { last_activity, ..summary };
            }
            None => state.rooms.push(summary),
        }
        sort_by_activity(&mut state.rooms);
    }

    async fn reload(&self, room_id: &str) {
        match fetch_summary(self.inner.store.as_ref(), room_id).await {
            Ok(Some(summary)) => self.upsert(summary).await,
            Ok(None) => {
                self.remove(room_id).await;
            }
            Err(e) => log::warn!("failed to reload room {room_id}: {e}"),
        }
    }
}

fn sort_by_activity(rooms: &mut [RoomSummary]) {
    rooms.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
}

/// One room with its roster, or `None` if the room is gone.
pub(crate) async fn fetch_summary(
    store: &dyn RemoteStore,
    room_id: &str,
) -> Result<Option<RoomSummary>, CoreError> {
    let Some(row) = store.select_one(&Query::from(Table::ChatRooms).eq("id", room_id)).await? else {
        return Ok(None);
    };
    let room = ChatRoom::from_row(&row)?;
    let rows = store
        .select(
            &Query::from(Table::RoomParticipants)
                .eq("room_id", room_id)
                .order("joined_at", true),
        )
        .await?;
    Ok(Some(RoomSummary::new(room, from_rows(&rows)?)))
}

async fn fetch_summaries(store: &dyn RemoteStore, room_ids: &[&str]) -> Result<Vec<RoomSummary>, CoreError> {
    if room_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rooms: Vec<ChatRoom> = from_rows(
        &store.select(&Query::from(Table::ChatRooms).in_list("id", room_ids.iter().copied())).await?,
    )?;
    let participants: Vec<RoomParticipant> = from_rows(
        &store
            .select(
                &Query::from(Table::RoomParticipants)
                    .in_list("room_id", room_ids.iter().copied())
                    .order("joined_at", true),
            )
            .await?,
    )?;

    let mut rosters: HashMap<String, Vec<RoomParticipant>> = HashMap::new();
    for p in participants {
        rosters.entry(p.room_id.clone()).or_default().push(p);
    }
    Ok(rooms
        .into_iter()
        .map(|room| {
            let roster = rosters.remove(&room.id).unwrap_or_default();
            RoomSummary::new(room, roster)
        })
        .collect())
}
