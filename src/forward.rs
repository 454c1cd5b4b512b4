//! Copying messages into other rooms.
//!
//! Each destination is written independently. One room failing does not undo
//! the others, so the result is a per-room report rather than a single error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use crate::models::{Message, MessageType, Outgoing};
use crate::store::{Query, RemoteStore, Table};
use crate::CoreError;

const UNKNOWN_AUTHOR: &str = "Unknown User";

/// Outcome for one destination room.
#[derive(Debug)]
pub struct Delivery {
    pub room_id: String,
    /// Ids of the messages written to the room.
    pub result: Result<Vec<String>, CoreError>,
}

#[derive(Debug, Default)]
pub struct ForwardReport {
    pub deliveries: Vec<Delivery>,
}

impl ForwardReport {
    pub fn delivered(&self) -> impl Iterator<Item = &str> {
        self.deliveries.iter().filter(|d| d.result.is_ok()).map(|d| d.room_id.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &CoreError)> {
        self.deliveries
            .iter()
            .filter_map(|d| d.result.as_ref().err().map(|e| (d.room_id.as_str(), e)))
    }

    pub fn succeeded_count(&self) -> usize {
        self.delivered().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_count() == 0
    }
}

pub struct ForwardingDispatcher {
    store: Arc<dyn RemoteStore>,
    actor_id: String,
}

impl ForwardingDispatcher {
    pub fn new(store: Arc<dyn RemoteStore>, actor_id: &str) -> Self {
        Self { store, actor_id: actor_id.to_string() }
    }

    /// Write a forwarded copy of every message into every destination room,
    /// prefixed with the original author when `attribute` is set.
    pub async fn forward(
        &self,
        messages: &[Message],
        destinations: &[String],
        attribute: bool,
    ) -> Result<ForwardReport, CoreError> {
        if messages.is_empty() {
            return Err(CoreError::Validation("no messages to forward".into()));
        }
        let mut seen = HashSet::new();
        let destinations: Vec<&str> = destinations
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty() && seen.insert(*d))
            .collect();
        if destinations.is_empty() {
            return Err(CoreError::Validation("no destination rooms".into()));
        }

        let authors = if attribute { self.author_names(messages).await } else { HashMap::new() };
        let payloads: Vec<Outgoing> = messages
            .iter()
            .map(|m| {
                let prefix = match authors.get(&m.author_id) {
                    Some(name) => format!("(Forwarded from {name}): "),
                    None => String::new(),
                };
                forwarded(m, &prefix)
            })
            .collect();

        // When the lookup itself fails every room is attempted and fails or
        // succeeds on its own write.
        let existing: Option<HashSet<String>> = match self
            .store
            .select(&Query::from(Table::ChatRooms).in_list("id", destinations.iter().copied()))
            .await
        {
            Ok(rows) => Some(
                rows.iter()
                    .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect(),
            ),
            Err(e) => {
                log::warn!("destination lookup failed, writing to every room: {e}");
                None
            }
        };

        let deliveries = join_all(destinations.iter().map(|room_id| {
            let rows = payloads.iter().map(|p| p.to_row(room_id, &self.actor_id)).collect::<Vec<_>>();
            let exists = existing.as_ref().map_or(true, |known| known.contains(*room_id));
            async move {
                let result = if exists {
                    self.store
                        .insert(Table::Messages, rows)
                        .await
                        .map(|stored| {
                            stored
                                .iter()
                                .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
                                .collect()
                        })
                        .map_err(CoreError::from)
                } else {
                    Err(CoreError::NotFound(format!("room {room_id}")))
                };
                Delivery { room_id: room_id.to_string(), result }
            }
        }))
        .await;

        let report = ForwardReport { deliveries };
        for (room_id, e) in report.failed() {
            log::warn!("forward to room {room_id} failed: {e}");
        }
        log::info!(
            "forwarded {} messages to {}/{} rooms",
            messages.len(),
            report.succeeded_count(),
            report.deliveries.len()
        );
        Ok(report)
    }

    /// Username per distinct author, looked up once each. Authors that cannot
    /// be resolved are shown as unknown.
    async fn author_names(&self, messages: &[Message]) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for message in messages {
            if names.contains_key(&message.author_id) {
                continue;
            }
            let name = match self
                .store
                .select_one(&Query::from(Table::Profiles).eq("id", message.author_id.as_str()))
                .await
            {
                Ok(Some(row)) => row.get("username").and_then(Value::as_str).map(str::to_string),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("author lookup for {} failed: {e}", message.author_id);
                    None
                }
            };
            let name = name.unwrap_or_else(|| {
                log::warn!("forwarding message by unknown author {}", message.author_id);
                UNKNOWN_AUTHOR.to_string()
            });
            names.insert(message.author_id.clone(), name);
        }
        names
    }
}

/// The message as it is written into the destination room.
fn forwarded(message: &Message, prefix: &str) -> Outgoing {
    let content = message.content.as_deref().unwrap_or_default();
    let body = match message.message_type {
        MessageType::Text | MessageType::Audio => content.to_string(),
        MessageType::File | MessageType::Image => {
            let name = message.attachment.as_ref().and_then(|a| a.name.as_deref()).unwrap_or(content);
            format!("Forwarded file: {name}")
        }
        MessageType::Gif => format!("Forwarded GIF: {content}"),
        MessageType::Sticker => format!("Forwarded sticker: {content}"),
    };
    Outgoing {
        content: Some(format!("{prefix}{body}")),
        message_type: message.message_type,
        attachment: message.attachment.clone(),
        reply_to: None,
    }
}
