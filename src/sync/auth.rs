//! Identity provider seam
//!
//! Sync and storage act on behalf of the signed-in principal; mutations are
//! rejected outright when nobody is signed in.

use crate::models::Principal;
use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait PrincipalProvider: Send + Sync {
    async fn current_user(&self) -> Option<Principal>;
}

/// Principal held in memory, swapped on sign-in and sign-out
#[derive(Default)]
pub struct StaticPrincipal {
    principal: RwLock<Option<Principal>>,
}

impl StaticPrincipal {
    pub fn new(principal: Option<Principal>) -> Self {
        Self {
            principal: RwLock::new(principal),
        }
    }

    pub async fn sign_in(&self, principal: Principal) {
        log::info!("Signed in as {}", principal.email);
        *self.principal.write().await = Some(principal);
    }

    pub async fn sign_out(&self) {
        if let Some(previous) = self.principal.write().await.take() {
            log::info!("Signed out {}", previous.email);
        }
    }
}

#[async_trait]
impl PrincipalProvider for StaticPrincipal {
    async fn current_user(&self) -> Option<Principal> {
        self.principal.read().await.clone()
    }
}
