use std::env;
use std::path::PathBuf;

/// Engine settings, read from `ROOMSYNC_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub database_url: String,
    pub blob_dir: PathBuf,
    pub public_base_url: String,
    pub profile_search_limit: u32,
    pub member_candidate_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            blob_dir: PathBuf::from("./blobs"),
            public_base_url: "http://localhost/storage/chat-files".into(),
            profile_search_limit: 10,
            member_candidate_limit: 20,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("ROOMSYNC_DATABASE_URL").unwrap_or(defaults.database_url),
            blob_dir: lookup("ROOMSYNC_BLOB_DIR").map(PathBuf::from).unwrap_or(defaults.blob_dir),
            public_base_url: lookup("ROOMSYNC_PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_base_url),
            profile_search_limit: lookup("ROOMSYNC_PROFILE_SEARCH_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.profile_search_limit),
            member_candidate_limit: lookup("ROOMSYNC_MEMBER_CANDIDATE_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.member_candidate_limit),
        }
    }
}
