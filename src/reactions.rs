//! Reaction loading, toggling and grouping.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{from_rows, new_reaction_row, MessageReaction, Record};
use crate::store::{Filter, Query, RemoteStore, StoreError, Table};
use crate::CoreError;

/// Emoji offered as one-tap reactions.
pub const QUICK_REACTIONS: [&str; 6] = ["❤️", "👍", "😂", "😮", "😢", "😡"];

/// All reactions with the same emoji, in the order they were added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub reactions: Vec<MessageReaction>,
}

impl ReactionGroup {
    pub fn count(&self) -> usize {
        self.reactions.len()
    }
}

#[derive(Clone)]
pub struct ReactionAggregator {
    store: Arc<dyn RemoteStore>,
}

impl ReactionAggregator {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub async fn fetch(&self, message_id: &str) -> Result<Vec<MessageReaction>, CoreError> {
        let rows = self
            .store
            .select(
                &Query::from(Table::MessageReactions)
                    .eq("message_id", message_id)
                    .order("created_at", true),
            )
            .await?;
        Ok(from_rows(&rows)?)
    }

    /// Reactions for many messages in one query, keyed by message id.
    /// Messages without reactions are absent from the map.
    pub async fn fetch_many(
        &self,
        message_ids: &[String],
    ) -> Result<HashMap<String, Vec<MessageReaction>>, CoreError> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .store
            .select(
                &Query::from(Table::MessageReactions)
                    .in_list("message_id", message_ids.iter().map(String::as_str))
                    .order("created_at", true),
            )
            .await?;

        let mut by_message: HashMap<String, Vec<MessageReaction>> = HashMap::new();
        for reaction in from_rows::<MessageReaction>(&rows)? {
            by_message.entry(reaction.message_id.clone()).or_default().push(reaction);
        }
        Ok(by_message)
    }

    /// Add `emoji` from `user_id` to the message, or take it away if
    /// `current` already has it. Returns the new reaction set.
    pub async fn toggle(
        &self,
        current: &[MessageReaction],
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Vec<MessageReaction>, CoreError> {
        if emoji.trim().is_empty() {
            return Err(CoreError::Validation("reaction emoji is empty".into()));
        }

        if let Some(existing) = current.iter().find(|r| r.key() == (message_id, user_id, emoji)) {
            self.store
                .delete(Table::MessageReactions, &[Filter::eq("id", existing.id.as_str())])
                .await?;
            log::debug!("reaction {emoji} removed from {message_id} by {user_id}");
            return Ok(current.iter().filter(|r| r.id != existing.id).cloned().collect());
        }

        match self
            .store
            .insert_one(Table::MessageReactions, new_reaction_row(message_id, user_id, emoji))
            .await
        {
            Ok(row) => {
                let reaction = MessageReaction::from_row(&row)?;
                let mut next = current.to_vec();
                next.push(reaction);
                Ok(next)
            }
            Err(StoreError::Conflict(_)) => {
                // Local set was stale: the reaction already exists remotely.
                log::warn!("reaction {emoji} on {message_id} already present, reloading");
                self.fetch(message_id).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Group by emoji, keeping the order in which each emoji first appeared.
pub fn group(reactions: &[MessageReaction]) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for reaction in reactions {
        match groups.iter_mut().find(|g| g.emoji == reaction.emoji) {
            Some(g) => g.reactions.push(reaction.clone()),
            None => groups.push(ReactionGroup {
                emoji: reaction.emoji.clone(),
                reactions: vec![reaction.clone()],
            }),
        }
    }
    groups
}

pub fn has_reacted(reactions: &[MessageReaction], user_id: &str, emoji: &str) -> bool {
    reactions.iter().any(|r| r.user_id == user_id && r.emoji == emoji)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testing::{memory_store, seed_message, seed_room};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn reaction(id: &str, user: &str, emoji: &str) -> MessageReaction {
        MessageReaction {
            id: id.into(),
            message_id: "m".into(),
            user_id: user.into(),
            emoji: emoji.into(),
            created_at: 0,
        }
    }

    #[test]
    fn group_preserves_first_seen_order() {
        let list = vec![
            reaction("1", "u1", "😂"),
            reaction("2", "u2", "👍"),
            reaction("3", "u3", "😂"),
        ];
        let groups = group(&list);
        let emoji: Vec<&str> = groups.iter().map(|g| g.emoji.as_str()).collect();
        assert_eq!(emoji, vec!["😂", "👍"]);
        assert_eq!(groups[0].count(), 2);
        assert!(has_reacted(&list, "u3", "😂"));
        assert!(!has_reacted(&list, "u3", "👍"));
    }

    #[tokio::test]
    async fn toggle_twice_restores_empty_set() {
        let store = memory_store().await;
        let room = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;
        let msg = seed_message(&store, &room.id, "u1", "hi").await;
        let agg = ReactionAggregator::new(store.clone());

        let once = agg.toggle(&[], &msg.id, "u1", "👍").await.unwrap();
        let groups = group(&once);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].emoji, "👍");
        assert_eq!(groups[0].reactions[0].user_id, "u1");

        let twice = agg.toggle(&once, &msg.id, "u1", "👍").await.unwrap();
        assert!(twice.is_empty());
        assert!(group(&twice).is_empty());
        assert!(agg.fetch(&msg.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_set_reloads_on_conflict() {
        let store = memory_store().await;
        let room = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;
        let msg = seed_message(&store, &room.id, "u1", "hi").await;
        let agg = ReactionAggregator::new(store.clone());

        agg.toggle(&[], &msg.id, "u1", "❤️").await.unwrap();
        let again = agg.toggle(&[], &msg.id, "u1", "❤️").await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn fetch_many_groups_by_message() {
        let store = memory_store().await;
        let room = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;
        let a = seed_message(&store, &room.id, "u1", "a").await;
        let b = seed_message(&store, &room.id, "u1", "b").await;
        let agg = ReactionAggregator::new(store.clone());

        agg.toggle(&[], &a.id, "u1", "👍").await.unwrap();
        agg.toggle(&[], &a.id, "u2", "👍").await.unwrap();

        let map = agg.fetch_many(&[a.id.clone(), b.id.clone()]).await.unwrap();
        assert_eq!(map.get(&a.id).map(Vec::len), Some(2));
        assert!(!map.contains_key(&b.id));
    }

    #[tokio::test]
    async fn empty_emoji_is_rejected() {
        let store = memory_store().await;
        let agg = ReactionAggregator::new(store);
        let err = agg.toggle(&[], "m", "u1", " ").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn toggles_keep_reactions_unique(ops in prop::collection::vec((0usize..3, 0usize..3), 1..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let users = ["u1", "u2", "u3"];
                let emoji = ["👍", "😂", "❤️"];

                let store = memory_store().await;
                let room = seed_room(&store, "u1", true, &[("u1", Role::Admin)]).await;
                let msg = seed_message(&store, &room.id, "u1", "hi").await;
                let agg = ReactionAggregator::new(store.clone());

                let mut current = Vec::new();
                let mut expected: HashSet<(usize, usize)> = HashSet::new();
                for (u, e) in ops {
                    current = agg.toggle(&current, &msg.id, users[u], emoji[e]).await.unwrap();
                    if !expected.remove(&(u, e)) {
                        expected.insert((u, e));
                    }
                }

                let keys: HashSet<(String, String)> =
                    current.iter().map(|r| (r.user_id.clone(), r.emoji.clone())).collect();
                assert_eq!(keys.len(), current.len());
                assert_eq!(current.len(), expected.len());
                assert_eq!(agg.fetch(&msg.id).await.unwrap().len(), expected.len());
            });
        }
    }
}
