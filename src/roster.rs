//! Room lifecycle and roster management: creating rooms, adding and removing
//! participants, renaming and deleting rooms, and the profile lookups that
//! feed those actions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use crate::config::EngineConfig;
use crate::directory::{fetch_summary, RoomDirectory};
use crate::models::{
    from_rows, new_participant_row, new_room_row, ChatRoom, Profile, Record, Role, RoomParticipant,
    RoomSummary, RosterEntry,
};
use crate::permissions::{self, Capabilities};
use crate::store::{Filter, Query, RemoteStore, Row, Table};
use crate::CoreError;

pub struct RoomManager {
    store: Arc<dyn RemoteStore>,
    actor: Profile,
    profile_search_limit: u32,
    member_candidate_limit: u32,
    directory: Option<RoomDirectory>,
}

impl RoomManager {
    pub fn new(store: Arc<dyn RemoteStore>, actor: Profile, config: &EngineConfig) -> Self {
        Self {
            store,
            actor,
            profile_search_limit: config.profile_search_limit,
            member_candidate_limit: config.member_candidate_limit,
            directory: None,
        }
    }

    /// Keep `directory` in step with rooms created, changed or left here.
    pub fn with_directory(mut self, directory: RoomDirectory) -> Self {
        self.directory = Some(directory);
        self
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    /// Two-person room with `other`, named after both users.
    pub async fn create_direct(&self, other: &Profile) -> Result<RoomSummary, CoreError> {
        if other.id == self.actor.id {
            return Err(CoreError::Validation("cannot start a direct chat with yourself".into()));
        }
        let name = format!("{}, {}", self.actor.username, other.username);
        self.create(new_room_row(&name, None, false, &self.actor.id), &[other.id.clone()])
            .await
    }

    pub async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
        member_ids: &[String],
    ) -> Result<RoomSummary, CoreError> {
        let name = required_name(name)?;
        let members: Vec<String> = member_ids
            .iter()
            .filter(|id| **id != self.actor.id)
            .cloned()
            .collect();
        if members.is_empty() {
            return Err(CoreError::Validation("a group needs at least one other member".into()));
        }
        self.create(new_room_row(name, blank_to_none(description), true, &self.actor.id), &members)
            .await
    }

    /// A room with only the actor in it.
    pub async fn create_room(
        &self,
        name: &str,
        description: Option<&str>,
        is_group: bool,
    ) -> Result<RoomSummary, CoreError> {
        let name = required_name(name)?;
        self.create(new_room_row(name, blank_to_none(description), is_group, &self.actor.id), &[])
            .await
    }

    /// Insert the room, then the actor as admin plus `members` as members.
    /// A failed roster insert removes the room again.
    async fn create(&self, room_row: Row, members: &[String]) -> Result<RoomSummary, CoreError> {
        let room = ChatRoom::from_row(&self.store.insert_one(Table::ChatRooms, room_row).await?)?;

        let mut seen = HashSet::new();
        let rows: Vec<Row> = std::iter::once((self.actor.id.as_str(), Role::Admin))
            .chain(members.iter().map(|id| (id.as_str(), Role::Member)))
            .filter(|(id, _)| seen.insert(*id))
            .map(|(id, role)| new_participant_row(&room.id, id, role))
            .collect();

        let participants = match self.store.insert(Table::RoomParticipants, rows).await {
            Ok(stored) => from_rows(&stored)?,
            Err(e) => {
                if let Err(cleanup) = self
                    .store
                    .delete(Table::ChatRooms, &[Filter::eq("id", room.id.as_str())])
                    .await
                {
                    log::warn!("room {} left without participants: {cleanup}", room.id);
                }
                return Err(e.into());
            }
        };

        let summary = RoomSummary::new(room, participants);
        log::info!(
            "created {} room {} with {} participants",
            if summary.room.is_group { "group" } else { "direct" },
            summary.id(),
            summary.participants.len()
        );
        if let Some(directory) = &self.directory {
            directory.upsert(summary.clone()).await;
        }
        Ok(summary)
    }

    // ── Roster ───────────────────────────────────────────────────────────────

    /// Add users as members, skipping anyone already on the roster.
    pub async fn add_members(&self, room_id: &str, user_ids: &[String]) -> Result<Vec<RoomParticipant>, CoreError> {
        let summary = self.authorize(room_id, Capabilities::MANAGE_ROSTER).await?;
        let present: HashSet<&str> = summary.participants.iter().map(|p| p.user_id.as_str()).collect();

        let mut seen = HashSet::new();
        let rows: Vec<Row> = user_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !present.contains(id) && seen.insert(*id))
            .map(|id| new_participant_row(room_id, id, Role::Member))
            .collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let added: Vec<RoomParticipant> = from_rows(&self.store.insert(Table::RoomParticipants, rows).await?)?;
        log::info!("added {} members to room {room_id}", added.len());
        self.reload_directory(room_id).await;
        Ok(added)
    }

    pub async fn remove_participant(&self, room_id: &str, participant_id: &str) -> Result<(), CoreError> {
        let summary = self.authorize(room_id, Capabilities::MANAGE_ROSTER).await?;
        if !summary.participants.iter().any(|p| p.id == participant_id) {
            return Err(CoreError::NotFound(format!("participant {participant_id}")));
        }
        self.store
            .delete(
                Table::RoomParticipants,
                &[Filter::eq("id", participant_id), Filter::eq("room_id", room_id)],
            )
            .await?;
        log::info!("removed participant {participant_id} from room {room_id}");
        self.reload_directory(room_id).await;
        Ok(())
    }

    pub async fn change_role(
        &self,
        room_id: &str,
        participant_id: &str,
        role: Role,
    ) -> Result<RoomParticipant, CoreError> {
        self.authorize(room_id, Capabilities::MANAGE_ROSTER).await?;

        let mut changes = Row::new();
        changes.insert("role".into(), json!(role.as_str()));
        let rows = self
            .store
            .update(
                Table::RoomParticipants,
                &[Filter::eq("id", participant_id), Filter::eq("room_id", room_id)],
                changes,
            )
            .await?;
        let updated = match rows.first() {
            Some(row) => RoomParticipant::from_row(row)?,
            None => return Err(CoreError::NotFound(format!("participant {participant_id}"))),
        };
        self.reload_directory(room_id).await;
        Ok(updated)
    }

    /// Remove the actor from the room. Always allowed.
    pub async fn leave(&self, room_id: &str) -> Result<(), CoreError> {
        self.store
            .delete(
                Table::RoomParticipants,
                &[Filter::eq("room_id", room_id), Filter::eq("user_id", self.actor.id.as_str())],
            )
            .await?;
        if let Some(directory) = &self.directory {
            directory.remove(room_id).await;
        }
        log::info!("{} left room {room_id}", self.actor.id);
        Ok(())
    }

    /// Participants with profiles, admins first, then by join time.
    pub async fn roster(&self, room_id: &str) -> Result<Vec<RosterEntry>, CoreError> {
        let rows = self
            .store
            .select(&Query::from(Table::RoomParticipants).eq("room_id", room_id).order("joined_at", true))
            .await?;
        let mut participants: Vec<RoomParticipant> = from_rows(&rows)?;
        participants.sort_by(|a, b| b.role.cmp(&a.role).then(a.joined_at.cmp(&b.joined_at)));

        let profile_rows = self
            .store
            .select(&Query::from(Table::Profiles).in_list("id", participants.iter().map(|p| p.user_id.as_str())))
            .await?;
        let mut profiles: HashMap<String, Profile> = from_rows::<Profile>(&profile_rows)?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        Ok(participants
            .into_iter()
            .map(|participant| {
                let profile = profiles.remove(&participant.user_id);
                RosterEntry { participant, profile }
            })
            .collect())
    }

    // ── Room ─────────────────────────────────────────────────────────────────

    pub async fn rename(&self, room_id: &str, new_name: &str) -> Result<ChatRoom, CoreError> {
        let name = required_name(new_name)?;
        let summary = self.summary(room_id).await?;
        if !summary.room.is_group {
            return Err(CoreError::Validation("direct chats cannot be renamed".into()));
        }
        self.require(&summary, Capabilities::RENAME_ROOM)?;

        let mut changes = Row::new();
        changes.insert("name".into(), json!(name));
        let rows = self
            .store
            .update(Table::ChatRooms, &[Filter::eq("id", room_id)], changes)
            .await?;
        let room = match rows.first() {
            Some(row) => ChatRoom::from_row(row)?,
            None => return Err(CoreError::NotFound(format!("room {room_id}"))),
        };
        self.reload_directory(room_id).await;
        Ok(room)
    }

    /// Delete messages, then participants, then the room. Not atomic: a
    /// failure part way leaves the earlier deletes applied.
    pub async fn delete_room(&self, room_id: &str) -> Result<(), CoreError> {
        self.authorize(room_id, Capabilities::DELETE_ROOM).await?;

        let messages = self.store.delete(Table::Messages, &[Filter::eq("room_id", room_id)]).await?;
        self.store
            .delete(Table::RoomParticipants, &[Filter::eq("room_id", room_id)])
            .await?;
        self.store.delete(Table::ChatRooms, &[Filter::eq("id", room_id)]).await?;

        if let Some(directory) = &self.directory {
            directory.remove(room_id).await;
        }
        log::info!("deleted room {room_id} with {} messages", messages.len());
        Ok(())
    }

    // ── Profiles ─────────────────────────────────────────────────────────────

    /// Other users whose name contains `term`.
    pub async fn search_profiles(&self, term: &str) -> Result<Vec<Profile>, CoreError> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .store
            .select(
                &Query::from(Table::Profiles)
                    .ilike("username", format!("%{term}%"))
                    .neq("id", self.actor.id.as_str())
                    .order("username", true)
                    .limit(self.profile_search_limit),
            )
            .await?;
        Ok(from_rows(&rows)?)
    }

    /// Profiles not yet in the room, optionally filtered by name.
    pub async fn member_candidates(&self, room_id: &str, term: Option<&str>) -> Result<Vec<Profile>, CoreError> {
        let rows = self
            .store
            .select(&Query::from(Table::RoomParticipants).eq("room_id", room_id))
            .await?;
        let current: Vec<RoomParticipant> = from_rows(&rows)?;

        let mut query = Query::from(Table::Profiles)
            .not_in("id", current.iter().map(|p| p.user_id.as_str()))
            .order("username", true)
            .limit(self.member_candidate_limit);
        if let Some(term) = term.map(str::trim).filter(|t| !t.is_empty()) {
            query = query.ilike("username", format!("%{term}%"));
        }
        Ok(from_rows(&self.store.select(&query).await?)?)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn summary(&self, room_id: &str) -> Result<RoomSummary, CoreError> {
        fetch_summary(self.store.as_ref(), room_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))
    }

    fn require(&self, summary: &RoomSummary, needed: Capabilities) -> Result<(), CoreError> {
        let caps = permissions::evaluate(&self.actor.id, &summary.room, &summary.participants);
        if caps.contains(needed) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!("not allowed to {} in room {}", describe(needed), summary.id())))
        }
    }

    async fn authorize(&self, room_id: &str, needed: Capabilities) -> Result<RoomSummary, CoreError> {
        let summary = self.summary(room_id).await?;
        self.require(&summary, needed)?;
        Ok(summary)
    }

    async fn reload_directory(&self, room_id: &str) {
        let Some(directory) = &self.directory else { return };
        match fetch_summary(self.store.as_ref(), room_id).await {
            Ok(Some(summary)) => directory.upsert(summary).await,
            Ok(None) => {
                directory.remove(room_id).await;
            }
            Err(e) => log::warn!("directory entry for {room_id} not refreshed: {e}"),
        }
    }
}

fn required_name(name: &str) -> Result<&str, CoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::Validation("room name is empty".into()));
    }
    Ok(name)
}

fn blank_to_none(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

fn describe(caps: Capabilities) -> &'static str {
    if caps.contains(Capabilities::DELETE_ROOM) {
        "delete the room"
    } else if caps.contains(Capabilities::RENAME_ROOM) {
        "rename the room"
    } else {
        "manage participants"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, profile, seed_message, seed_profile, seed_room, FailingStore};

    fn manager(store: Arc<dyn RemoteStore>, actor: Profile) -> RoomManager {
        RoomManager::new(store, actor, &EngineConfig::default())
    }

    #[tokio::test]
    async fn direct_room_names_both_users() {
        let store = memory_store().await;
        let alice = seed_profile(&store, "u1", "alice").await;
        let bob = seed_profile(&store, "u2", "bob").await;
        let rooms = manager(store.clone(), alice.clone());

        let summary = rooms.create_direct(&bob).await.unwrap();
        assert_eq!(summary.room.name, "alice, bob");
        assert!(!summary.room.is_group);
        assert_eq!(summary.role_of("u1"), Some(Role::Admin));
        assert_eq!(summary.role_of("u2"), Some(Role::Member));

        assert!(matches!(rooms.create_direct(&alice).await, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn group_creation_validates_and_updates_directory() {
        let store = memory_store().await;
        let directory = RoomDirectory::new("u1", store.clone(), store.clone());
        let rooms = manager(store.clone(), profile("u1", "alice")).with_directory(directory.clone());

        assert!(matches!(
            rooms.create_group("  ", None, &["u2".into()]).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            rooms.create_group("Team", None, &["u1".into()]).await,
            Err(CoreError::Validation(_))
        ));

        let team = rooms
            .create_group(" Team ", Some("  "), &["u2".into(), "u3".into(), "u2".into()])
            .await
            .unwrap();
        assert_eq!(team.room.name, "Team");
        assert!(team.room.description.is_none());
        assert_eq!(team.participants.len(), 3);
        assert_eq!(directory.list().await[0].id(), team.id());

        let solo = rooms.create_room("Notes", Some("mine"), false).await.unwrap();
        assert_eq!(solo.participants.len(), 1);
        assert_eq!(solo.room.description.as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn roster_changes_need_admin() {
        let sqlite = memory_store().await;
        let room = seed_room(&sqlite, "u1", true, &[("u1", Role::Admin), ("u2", Role::Moderator)]).await;
        let failing = Arc::new(FailingStore::new(sqlite.clone()));

        let moderator = manager(failing.clone(), profile("u2", "bob"));
        assert!(matches!(
            moderator.add_members(&room.id, &["u3".into()]).await,
            Err(CoreError::PermissionDenied(_))
        ));
        assert_eq!(failing.writes(), 0);

        let admin = manager(sqlite.clone(), profile("u1", "alice"));
        let added = admin.add_members(&room.id, &["u2".into(), "u3".into(), "u3".into()]).await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].user_id, "u3");
        assert_eq!(added[0].role, Role::Member);

        let promoted = admin.change_role(&room.id, &added[0].id, Role::Admin).await.unwrap();
        assert_eq!(promoted.role, Role::Admin);

        // Promoted members can manage the roster too.
        let u3 = manager(sqlite.clone(), profile("u3", "carol"));
        let bob = admin.roster(&room.id).await.unwrap().into_iter().find(|e| e.participant.user_id == "u2").unwrap();
        u3.remove_participant(&room.id, &bob.participant.id).await.unwrap();
        assert_eq!(admin.roster(&room.id).await.unwrap().len(), 2);

        assert!(matches!(
            admin.remove_participant(&room.id, "nobody").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn roster_lists_admins_first_with_profiles() {
        let store = memory_store().await;
        seed_profile(&store, "u1", "alice").await;
        seed_profile(&store, "u2", "bob").await;
        let room = seed_room(&store, "u1", true, &[("u2", Role::Member), ("u3", Role::Moderator), ("u1", Role::Admin)]).await;

        let entries = manager(store.clone(), profile("u1", "alice")).roster(&room.id).await.unwrap();
        let order: Vec<&str> = entries.iter().map(|e| e.participant.user_id.as_str()).collect();
        assert_eq!(order, vec!["u1", "u3", "u2"]);
        assert_eq!(entries[0].profile.as_ref().map(|p| p.username.as_str()), Some("alice"));
        assert!(entries[1].profile.is_none());
    }

    #[tokio::test]
    async fn rename_rules() {
        let store = memory_store().await;
        let group = seed_room(&store, "u1", true, &[("u1", Role::Admin), ("u2", Role::Member)]).await;
        let direct = seed_room(&store, "u1", false, &[("u1", Role::Admin), ("u2", Role::Member)]).await;

        let admin = manager(store.clone(), profile("u1", "alice"));
        let member = manager(store.clone(), profile("u2", "bob"));

        assert!(matches!(admin.rename(&direct.id, "x").await, Err(CoreError::Validation(_))));
        assert!(matches!(admin.rename(&group.id, " ").await, Err(CoreError::Validation(_))));
        assert!(matches!(member.rename(&group.id, "Mine").await, Err(CoreError::PermissionDenied(_))));
        assert_eq!(admin.rename(&group.id, " Renamed ").await.unwrap().name, "Renamed");
    }

    #[tokio::test]
    async fn delete_room_clears_everything() {
        let store = memory_store().await;
        let room = seed_room(&store, "u1", true, &[("u1", Role::Admin), ("u2", Role::Member)]).await;
        seed_message(&store, &room.id, "u2", "bye").await;
        let directory = RoomDirectory::new("u1", store.clone(), store.clone());
        directory.refresh().await.unwrap();

        let member = manager(store.clone(), profile("u2", "bob"));
        assert!(matches!(member.delete_room(&room.id).await, Err(CoreError::PermissionDenied(_))));

        let admin = manager(store.clone(), profile("u1", "alice")).with_directory(directory.clone());
        admin.delete_room(&room.id).await.unwrap();

        for table in [Table::Messages, Table::RoomParticipants, Table::ChatRooms] {
            assert!(store.select(&Query::from(table)).await.unwrap().is_empty(), "{table} not empty");
        }
        assert!(directory.list().await.is_empty());
    }

    #[tokio::test]
    async fn leave_drops_room_from_directory() {
        let store = memory_store().await;
        let room = seed_room(&store, "u1", true, &[("u1", Role::Admin), ("u2", Role::Member)]).await;
        let directory = RoomDirectory::new("u2", store.clone(), store.clone());
        directory.refresh().await.unwrap();
        assert_eq!(directory.list().await.len(), 1);

        manager(store.clone(), profile("u2", "bob")).with_directory(directory.clone()).leave(&room.id).await.unwrap();
        assert!(directory.list().await.is_empty());
        let left = store
            .select(&Query::from(Table::RoomParticipants).eq("room_id", room.id.as_str()))
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn profile_search_and_candidates() {
        let store = memory_store().await;
        for (id, name) in [("u1", "alice"), ("u2", "alfred"), ("u3", "bob"), ("u4", "Alma")] {
            seed_profile(&store, id, name).await;
        }
        let room = seed_room(&store, "u1", true, &[("u1", Role::Admin), ("u2", Role::Member)]).await;
        let config = EngineConfig { profile_search_limit: 1, ..EngineConfig::default() };
        let rooms = RoomManager::new(store.clone(), profile("u1", "alice"), &config);

        assert!(rooms.search_profiles("  ").await.unwrap().is_empty());
        let found = rooms.search_profiles("AL").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_ne!(found[0].id, "u1");

        let candidates = rooms.member_candidates(&room.id, None).await.unwrap();
        let ids: Vec<&str> = candidates.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["u4", "u3"]);

        let filtered = rooms.member_candidates(&room.id, Some("bo")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].username, "bob");
    }

    #[tokio::test]
    async fn roster_changes_keep_directory_order() {
        let store = memory_store().await;
        let older = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;
        let newer = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;
        let directory = RoomDirectory::new("u1", store.clone(), store.clone());
        directory.refresh().await.unwrap();
        assert_eq!(directory.list().await[0].id(), newer.id);

        let rooms = manager(store.clone(), profile("u1", "alice")).with_directory(directory.clone());
        let added = rooms.add_members(&older.id, &["u9".to_string()]).await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(directory.list().await[0].id(), newer.id);

        directory.refresh().await.unwrap();
        let ids: Vec<String> = directory.list().await.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec![newer.id.clone(), older.id.clone()]);
        assert_eq!(directory.get(&older.id).await.unwrap().participants.len(), 2);
    }
}
