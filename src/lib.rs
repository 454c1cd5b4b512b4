//! Client-side room and message synchronisation engine.
//!
//! The engine keeps a local view of chat rooms, rosters, messages and
//! reactions consistent with a remote store that serves both queries and a
//! push-style change feed. The remote store, change feed, blob store and
//! identity provider are collaborator traits (see [`store`], [`blobs`] and
//! [`identity`]); [`db::SqliteStore`] is a local implementation of the first
//! two.

pub mod blobs;
pub mod config;
pub mod db;
pub mod directory;
pub mod forward;
pub mod identity;
pub mod models;
pub mod permissions;
pub mod reactions;
pub mod roster;
pub mod selection;
pub mod session;
pub mod store;
pub mod stream;

#[cfg(test)]
mod testing;

use std::time::{SystemTime, UNIX_EPOCH};

pub use blobs::{BlobError, BlobHandle, BlobStore, LocalBlobStore};
pub use config::EngineConfig;
pub use directory::{ParticipantOutcome, RoomDirectory};
pub use forward::{Delivery, ForwardReport, ForwardingDispatcher};
pub use identity::{IdentityProvider, StaticIdentity};
pub use models::{
    Attachment, ChatRoom, Message, MessageReaction, MessageType, Outgoing, PresenceStatus,
    Profile, Role, RoomParticipant, RoomSummary, RosterEntry,
};
pub use permissions::Capabilities;
pub use reactions::{ReactionAggregator, ReactionGroup};
pub use roster::RoomManager;
pub use selection::SelectionManager;
pub use session::ChatSession;
pub use store::{
    Backend, ChangeEvent, ChangeOp, FeedFilter, Filter, Query, RealtimeFeed, RemoteStore, Row,
    StoreError, Subscription, SubscriptionHandle, Table,
};
pub use stream::{Applied, BulkOutcome, MessageStream};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Per-operation failure surfaced to the caller.
///
/// Nothing here is fatal to the process: every variant is recoverable by
/// retrying or correcting the user action.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no signed-in profile")]
    NotSignedIn,
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Returns true if repeating the same action may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Remote(_))
    }
}

impl From<store::StoreError> for CoreError {
    fn from(e: store::StoreError) -> Self {
        match e {
            store::StoreError::NotFound(what) => CoreError::NotFound(what),
            other => CoreError::Remote(other.to_string()),
        }
    }
}

impl From<blobs::BlobError> for CoreError {
    fn from(e: blobs::BlobError) -> Self {
        CoreError::Remote(e.to_string())
    }
}

impl From<db::DbError> for CoreError {
    fn from(e: db::DbError) -> Self {
        CoreError::Remote(e.to_string())
    }
}

/// Microseconds since the Unix epoch.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_remote_failures_are_retryable() {
        assert!(CoreError::Remote("timeout".into()).is_retryable());
        assert!(!CoreError::Validation("empty".into()).is_retryable());
        assert!(!CoreError::PermissionDenied("not author".into()).is_retryable());
        assert!(!CoreError::NotFound("message".into()).is_retryable());
    }

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: CoreError = store::StoreError::NotFound("room r1".into()).into();
        assert!(matches!(err, CoreError::NotFound(ref what) if what == "room r1"));

        let err: CoreError = store::StoreError::Request("boom".into()).into();
        assert!(matches!(err, CoreError::Remote(_)));
    }
}
