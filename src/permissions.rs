//! Capability evaluation for an actor in a room.
//!
//! Pure: depends only on the room record and its roster.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::models::{ChatRoom, Message, Role, RoomParticipant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        const EDIT_OWN_MESSAGES   = 1 << 0;
        const DELETE_OWN_MESSAGES = 1 << 1;
        const DELETE_ANY_MESSAGE  = 1 << 2;
        const MANAGE_ROSTER       = 1 << 3;
        const RENAME_ROOM         = 1 << 4;
        const DELETE_ROOM         = 1 << 5;
    }
}

impl Capabilities {
    /// What every participant may do with their own content.
    pub const BASE: Self = Self::EDIT_OWN_MESSAGES.union(Self::DELETE_OWN_MESSAGES);

    pub const ROOM_ADMIN: Self = Self::BASE
        .union(Self::DELETE_ANY_MESSAGE)
        .union(Self::MANAGE_ROSTER)
        .union(Self::RENAME_ROOM)
        .union(Self::DELETE_ROOM);
}

/// Capability table by stored role.
///
/// Moderator currently unlocks nothing beyond member.
pub fn role_capabilities(role: Role) -> Capabilities {
    match role {
        Role::Admin => Capabilities::ROOM_ADMIN,
        Role::Moderator | Role::Member => Capabilities::BASE,
    }
}

/// Capabilities of `actor_id` in `room`.
///
/// The room creator is an admin whatever the roster says. Deleting other
/// people's messages is only possible in group rooms. Actors absent from the
/// roster still hold the base capabilities; they only ever apply to their own
/// content.
pub fn evaluate(actor_id: &str, room: &ChatRoom, roster: &[RoomParticipant]) -> Capabilities {
    let mut caps = if room.created_by == actor_id {
        Capabilities::ROOM_ADMIN
    } else {
        roster
            .iter()
            .find(|p| p.user_id == actor_id)
            .map(|p| role_capabilities(p.role))
            .unwrap_or(Capabilities::BASE)
    };
    if !room.is_group {
        caps.remove(Capabilities::DELETE_ANY_MESSAGE);
    }
    caps
}

pub fn can_edit(actor_id: &str, message: &Message) -> bool {
    message.author_id == actor_id
}

pub fn can_delete(actor_id: &str, caps: Capabilities, message: &Message) -> bool {
    if message.author_id == actor_id {
        caps.contains(Capabilities::DELETE_OWN_MESSAGES)
    } else {
        caps.contains(Capabilities::DELETE_ANY_MESSAGE)
    }
}
