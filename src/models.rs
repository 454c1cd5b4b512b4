//! Entity types shared by every component.
//!
//! Records travel through the remote store as JSON rows whose column names
//! follow the store schema (`user_id`, `message_type`, `reaction`, ...). The
//! [`Record`] impls below are the only place that knows that mapping.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::{Row, StoreError, Table};

// ─── Record mapping ──────────────────────────────────────────────────────────

/// A typed view over one row of a store table.
pub trait Record: Sized {
    const TABLE: Table;

    fn from_row(row: &Row) -> Result<Self, StoreError>;
}

fn decode<T: for<'de> Deserialize<'de>>(table: Table, row: &Row) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(row.clone()))
        .map_err(|e| StoreError::Decode(format!("{}: {e}", table.as_str())))
}

fn into_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Decode every row, failing on the first malformed one.
pub fn from_rows<T: Record>(rows: &[Row]) -> Result<Vec<T>, StoreError> {
    rows.iter().map(T::from_row).collect()
}

// ─── Profile ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
    Away,
}

/// Identity-provider owned profile; read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    pub last_seen: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Record for Profile {
    const TABLE: Table = Table::Profiles;

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        decode(Self::TABLE, row)
    }
}

// ─── Room ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub is_group: bool,
    pub created_by: String,
    pub created_at: i64,
    /// Last activity; advanced by message inserts and explicit updates.
    pub updated_at: i64,
}

impl Record for ChatRoom {
    const TABLE: Table = Table::ChatRooms;

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        decode(Self::TABLE, row)
    }
}

/// Row for a room that does not exist yet.
pub fn new_room_row(name: &str, description: Option<&str>, is_group: bool, created_by: &str) -> Row {
    into_row(json!({
        "name": name,
        "description": description,
        "is_group": is_group,
        "created_by": created_by,
    }))
}

// ─── Participant ─────────────────────────────────────────────────────────────

/// Participant role, strictly ordered `Admin > Moderator > Member`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Moderator,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "moderator" => Some(Role::Moderator),
            "member" => Some(Role::Member),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Role::Admin => 2,
            Role::Moderator => 1,
            Role::Member => 0,
        }
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomParticipant {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub role: Role,
    pub joined_at: i64,
}

impl Record for RoomParticipant {
    const TABLE: Table = Table::RoomParticipants;

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        decode(Self::TABLE, row)
    }
}

pub fn new_participant_row(room_id: &str, user_id: &str, role: Role) -> Row {
    into_row(json!({
        "room_id": room_id,
        "user_id": user_id,
        "role": role.as_str(),
    }))
}

/// A roster row joined with its profile, when the profile is known.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub participant: RoomParticipant,
    pub profile: Option<Profile>,
}

/// A room as shown in the directory: record, roster and last activity.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSummary {
    pub room: ChatRoom,
    pub participants: Vec<RoomParticipant>,
    pub last_activity: i64,
}

impl RoomSummary {
    /// Last activity is the room's `updated_at`; roster changes do not move it.
    pub fn new(room: ChatRoom, participants: Vec<RoomParticipant>) -> Self {
        let last_activity = room.updated_at;
        Self { room, participants, last_activity }
    }

    pub fn id(&self) -> &str {
        &self.room.id
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        self.participants.iter().find(|p| p.user_id == user_id).map(|p| p.role)
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Gif,
    Sticker,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::Audio => "audio",
            MessageType::Gif => "gif",
            MessageType::Sticker => "sticker",
        }
    }

    /// Attachment type inferred from a file name's extension.
    pub fn for_file_name(file_name: &str) -> Self {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" | "heic" => MessageType::Image,
            "mp3" | "wav" | "ogg" | "m4a" | "aac" | "flac" | "opus" => MessageType::Audio,
            _ => MessageType::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub name: Option<String>,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub author_id: String,
    /// `None` only for non-text messages carrying an attachment.
    pub content: Option<String>,
    pub message_type: MessageType,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<String>,
    pub edited_at: Option<i64>,
    pub created_at: i64,
    /// Derived state; never written back to the store.
    pub reactions: Vec<MessageReaction>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageRecord {
    id: String,
    room_id: String,
    user_id: String,
    content: Option<String>,
    #[serde(default)]
    message_type: MessageType,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<i64>,
    reply_to: Option<String>,
    edited_at: Option<i64>,
    created_at: i64,
}

impl Record for Message {
    const TABLE: Table = Table::Messages;

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        let rec: MessageRecord = decode(Self::TABLE, row)?;
        let attachment = rec.file_url.map(|url| Attachment {
            url,
            name: rec.file_name,
            size: rec.file_size,
        });
        Ok(Message {
            id: rec.id,
            room_id: rec.room_id,
            author_id: rec.user_id,
            content: rec.content,
            message_type: rec.message_type,
            attachment,
            reply_to: rec.reply_to,
            edited_at: rec.edited_at,
            created_at: rec.created_at,
            reactions: Vec::new(),
        })
    }
}

/// A message that has not been written yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outgoing {
    pub content: Option<String>,
    pub message_type: MessageType,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<String>,
}

impl Outgoing {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), ..Self::default() }
    }

    pub fn with_attachment(
        message_type: MessageType,
        content: Option<String>,
        attachment: Attachment,
    ) -> Self {
        Self { content, message_type, attachment: Some(attachment), reply_to: None }
    }

    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    /// Row for the `messages` table, authored by `author_id` in `room_id`.
    pub fn to_row(&self, room_id: &str, author_id: &str) -> Row {
        let (file_url, file_name, file_size) = match &self.attachment {
            Some(a) => (Some(a.url.as_str()), a.name.as_deref(), a.size),
            None => (None, None, None),
        };
        into_row(json!({
            "room_id": room_id,
            "user_id": author_id,
            "content": self.content,
            "message_type": self.message_type.as_str(),
            "file_url": file_url,
            "file_name": file_name,
            "file_size": file_size,
            "reply_to": self.reply_to,
        }))
    }
}

// ─── Reaction ────────────────────────────────────────────────────────────────

/// Unique per `(message_id, user_id, emoji)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReaction {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    #[serde(rename = "reaction")]
    pub emoji: String,
    pub created_at: i64,
}

impl MessageReaction {
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.message_id, &self.user_id, &self.emoji)
    }
}

impl Record for MessageReaction {
    const TABLE: Table = Table::MessageReactions;

    fn from_row(row: &Row) -> Result<Self, StoreError> {
        decode(Self::TABLE, row)
    }
}

pub fn new_reaction_row(message_id: &str, user_id: &str, emoji: &str) -> Row {
    into_row(json!({
        "message_id": message_id,
        "user_id": user_id,
        "reaction": emoji,
    }))
}
