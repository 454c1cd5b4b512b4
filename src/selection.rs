//! Multi-select over the open room's messages, for bulk actions.

use std::collections::HashSet;

use crate::stream::{BulkOutcome, MessageStream};

/// Selected message ids for one room view. Never persisted.
#[derive(Debug, Default)]
pub struct SelectionManager {
    selected: HashSet<String>,
    active: bool,
}

impl SelectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether selection mode is on.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn enter(&mut self) {
        self.active = true;
    }

    /// Leave selection mode, dropping the selection.
    pub fn exit(&mut self) {
        self.selected.clear();
        self.active = false;
    }

    /// Flip one id. Selecting enters selection mode.
    pub fn toggle(&mut self, message_id: &str) -> bool {
        if self.selected.remove(message_id) {
            false
        } else {
            self.selected.insert(message_id.to_string());
            self.active = true;
            true
        }
    }

    /// Select every id in `all`, or clear if they are all selected already.
    pub fn select_all(&mut self, all: &[String]) {
        let everything = !all.is_empty() && all.iter().all(|id| self.selected.contains(id));
        if everything {
            self.selected.clear();
        } else {
            self.selected.extend(all.iter().cloned());
            self.active = true;
        }
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn is_selected(&self, message_id: &str) -> bool {
        self.selected.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Selected ids in the stream's display order.
    pub async fn ids(&self, stream: &MessageStream) -> Vec<String> {
        stream
            .message_ids()
            .await
            .into_iter()
            .filter(|id| self.selected.contains(id))
            .collect()
    }

    /// Forget ids no longer in `present`.
    pub fn retain(&mut self, present: &[String]) {
        let keep: HashSet<&str> = present.iter().map(String::as_str).collect();
        self.selected.retain(|id| keep.contains(id.as_str()));
    }

    /// Delete the selection through `stream`. Selection mode ends whatever
    /// the outcome.
    pub async fn bulk_delete(&mut self, stream: &MessageStream) -> BulkOutcome {
        let ids: Vec<String> = self.selected.iter().cloned().collect();
        let outcome = stream.delete_many(&ids).await;
        self.exit();
        outcome
    }
}
