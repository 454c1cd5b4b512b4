//! A signed-in user's view: the room directory plus at most one open room.
//!
//! The session owns every live subscription. Opening another room releases
//! the previous room's subscription before the new one is taken, and signing
//! out releases everything.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::directory::RoomDirectory;
use crate::forward::ForwardingDispatcher;
use crate::identity::IdentityProvider;
use crate::models::Profile;
use crate::roster::RoomManager;
use crate::selection::SelectionManager;
use crate::store::{self, Backend, SubscriptionHandle};
use crate::stream::{BulkOutcome, MessageStream};
use crate::CoreError;

struct ActiveRoom {
    stream: MessageStream,
    subscription: SubscriptionHandle,
    selection: SelectionManager,
}

pub struct ChatSession {
    identity: Arc<dyn IdentityProvider>,
    backend: Backend,
    config: EngineConfig,
    actor: Profile,
    directory: RoomDirectory,
    directory_sub: Option<SubscriptionHandle>,
    active: Option<ActiveRoom>,
}

impl ChatSession {
    /// Load the directory for the signed-in user and start following it.
    pub async fn start(
        identity: Arc<dyn IdentityProvider>,
        backend: Backend,
        config: EngineConfig,
    ) -> Result<Self, CoreError> {
        let actor = identity.current_profile().ok_or(CoreError::NotSignedIn)?;
        let directory = RoomDirectory::new(&actor.id, backend.store.clone(), backend.feed.clone());
        directory.refresh().await?;
        let directory_sub = directory.subscribe().await?;

        log::info!("session started for {} ({})", actor.username, actor.id);
        Ok(Self {
            identity,
            backend,
            config,
            actor,
            directory,
            directory_sub: Some(directory_sub),
            active: None,
        })
    }

    /// Open the configured local backend and start a session on it.
    pub async fn connect(identity: Arc<dyn IdentityProvider>, config: EngineConfig) -> Result<Self, CoreError> {
        let backend = store::bootstrap(&config).await?;
        Self::start(identity, backend, config).await
    }

    pub fn actor(&self) -> &Profile {
        &self.actor
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn rooms(&self) -> RoomManager {
        RoomManager::new(self.backend.store.clone(), self.actor.clone(), &self.config)
            .with_directory(self.directory.clone())
    }

    pub fn forwarder(&self) -> ForwardingDispatcher {
        ForwardingDispatcher::new(self.backend.store.clone(), &self.actor.id)
    }

    /// Switch to `room_id`, releasing the room open before it.
    pub async fn open_room(&mut self, room_id: &str) -> Result<&MessageStream, CoreError> {
        self.close_room();

        let stream = MessageStream::new(room_id, &self.actor.id, &self.backend, Some(self.directory.clone()));
        // Subscribed first so nothing written during the load is missed.
        let subscription = stream.subscribe().await?;
        stream.load().await?;

        log::debug!("opened room {room_id}");
        let active = self.active.insert(ActiveRoom {
            stream,
            subscription,
            selection: SelectionManager::new(),
        });
        Ok(&active.stream)
    }

    pub fn close_room(&mut self) {
        if let Some(active) = self.active.take() {
            log::debug!("closed room {}", active.stream.room_id());
            active.subscription.cancel();
        }
    }

    pub fn active_stream(&self) -> Option<&MessageStream> {
        self.active.as_ref().map(|a| &a.stream)
    }

    pub fn selection(&self) -> Option<&SelectionManager> {
        self.active.as_ref().map(|a| &a.selection)
    }

    pub fn selection_mut(&mut self) -> Option<&mut SelectionManager> {
        self.active.as_mut().map(|a| &mut a.selection)
    }

    /// Delete the open room's selection. `None` when no room is open.
    pub async fn delete_selected(&mut self) -> Option<BulkOutcome> {
        let active = self.active.as_mut()?;
        Some(active.selection.bulk_delete(&active.stream).await)
    }

    /// Release every subscription, then sign out with the identity provider.
    pub async fn sign_out(mut self) -> Result<(), CoreError> {
        self.close_room();
        if let Some(sub) = self.directory_sub.take() {
            sub.cancel();
        }
        self.identity.sign_out().await?;
        log::info!("{} signed out", self.actor.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::models::{Outgoing, Role};
    use crate::testing::{backend, memory_store, profile, seed_room, wait_until};

    fn identity(id: &str, name: &str) -> Arc<StaticIdentity> {
        Arc::new(StaticIdentity::new(profile(id, name)))
    }

    #[tokio::test]
    async fn requires_a_signed_in_profile() {
        let store = memory_store().await;
        let who = identity("u1", "alice");
        who.sign_out().await.unwrap();

        let result = ChatSession::start(who, backend(store), EngineConfig::default()).await;
        assert!(matches!(result, Err(CoreError::NotSignedIn)));
    }

    #[tokio::test]
    async fn switching_rooms_releases_the_previous_subscription() {
        let store = memory_store().await;
        let a = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;
        let b = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;

        let mut session = ChatSession::start(identity("u1", "alice"), backend(store.clone()), EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(session.directory().list().await.len(), 2);
        assert_eq!(store.subscriber_count(), 1);

        session.open_room(&a.id).await.unwrap();
        assert_eq!(store.subscriber_count(), 2);

        session.open_room(&b.id).await.unwrap();
        let sqlite = &store;
        assert!(wait_until(|| async move { sqlite.subscriber_count() == 2 }).await);
        assert_eq!(session.active_stream().map(|s| s.room_id().to_string()), Some(b.id.clone()));

        assert!(session.open_room("missing").await.is_err());
        assert!(session.active_stream().is_none());

        session.sign_out().await.unwrap();
        assert!(wait_until(|| async move { sqlite.subscriber_count() == 0 }).await);
    }

    #[tokio::test]
    async fn open_room_end_to_end() {
        let store = memory_store().await;
        let room = seed_room(&store, "u1", true, &[("u1", Role::Admin), ("u2", Role::Member)]).await;
        let target = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;

        let mut session = ChatSession::start(identity("u1", "alice"), backend(store.clone()), EngineConfig::default())
            .await
            .unwrap();
        let stream = session.open_room(&room.id).await.unwrap().clone();

        let first = stream.send(Outgoing::text("one")).await.unwrap();
        let second = stream.send(Outgoing::text("two")).await.unwrap();
        assert_eq!(session.directory().list().await[0].id(), room.id);

        let report = session.forwarder().forward(&[first.clone()], &[target.id.clone()], false).await.unwrap();
        assert!(report.is_complete());

        let selection = session.selection_mut().unwrap();
        selection.toggle(&first.id);
        selection.toggle(&second.id);
        let outcome = session.delete_selected().await.unwrap();
        assert_eq!(outcome.succeeded_count(), 2);
        assert!(stream.is_empty().await);
        assert!(session.selection().is_some_and(|s| !s.is_active()));
    }

    #[tokio::test]
    async fn connect_bootstraps_a_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig { blob_dir: dir.path().join("blobs"), ..EngineConfig::default() };

        let session = ChatSession::connect(identity("u1", "alice"), config).await.unwrap();
        assert!(session.directory().list().await.is_empty());
        assert!(dir.path().join("blobs").is_dir());

        let created = session.rooms().create_room("Notes", None, false).await.unwrap();
        assert_eq!(session.directory().list().await[0].id(), created.id());
    }
}
