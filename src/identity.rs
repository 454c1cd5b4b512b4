use std::sync::RwLock;

use async_trait::async_trait;

use crate::models::Profile;
use crate::store::StoreError;

/// Supplies the signed-in profile. Read-only to the engine apart from
/// signing out.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn current_profile(&self) -> Option<Profile>;

    async fn sign_out(&self) -> Result<(), StoreError>;
}

/// Identity fixed at construction; `sign_out` forgets it.
#[derive(Debug)]
pub struct StaticIdentity {
    profile: RwLock<Option<Profile>>,
}

impl StaticIdentity {
    pub fn new(profile: Profile) -> Self {
        Self { profile: RwLock::new(Some(profile)) }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    fn current_profile(&self) -> Option<Profile> {
        self.profile.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn sign_out(&self) -> Result<(), StoreError> {
        *self.profile.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
