use std::sync::Arc;

use crate::collaborators::Collaborators;
use crate::error::ServiceError;
use crate::locks::KeyedLocks;
use crate::models::{AccountIntegration, WatchRegistration};

/// Registers, renews and revokes push subscriptions.
///
/// Holds the per-account lock registry shared with the sync engine so that a
/// renewal never interleaves with a cursor advance for the same account.
pub struct SubscriptionManager {
    collab: Collaborators,
    account_locks: Arc<KeyedLocks<String>>,
}

impl SubscriptionManager {
    pub fn new(collab: Collaborators) -> Self {
        Self {
            collab,
            account_locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub fn account_locks(&self) -> Arc<KeyedLocks<String>> {
        self.account_locks.clone()
    }

    /// Register (or renew) the subscription. Replaces cursor and expiry.
    /// `Auth` errors propagate untouched so the caller can deactivate.
    pub async fn register(&self, account_id: &str) -> Result<WatchRegistration, ServiceError> {
        let _guard = self.account_locks.lock(account_id.to_string()).await;
        let account = self.load(account_id)?;
        self.register_locked(&account).await
    }

    /// Refresh an existing watch. The account is re-read under its lock, so a
    /// watch revoked since the caller listed it stays revoked (`Ok(None)`).
    pub async fn renew(
        &self,
        account_id: &str,
    ) -> Result<Option<WatchRegistration>, ServiceError> {
        let _guard = self.account_locks.lock(account_id.to_string()).await;
        let account = self.load(account_id)?;
        if !account.watch.active {
            tracing::debug!("Skipping renewal for {}: watch no longer active", account.email);
            return Ok(None);
        }
        self.register_locked(&account).await.map(Some)
    }

    /// Same as [`register`](Self::register) for a caller already holding the
    /// account lock.
    pub(crate) async fn register_locked(
        &self,
        account: &AccountIntegration,
    ) -> Result<WatchRegistration, ServiceError> {
        let registration = self
            .collab
            .retry
            .run("subscribe", || self.collab.provider.subscribe(account))
            .await?;

        self.collab
            .db
            .activate_watch(&account.id, &registration.cursor, registration.expires_at)
            .map_err(ServiceError::storage)?;

        tracing::info!(
            "Watch registered for {} (cursor {}, expires {})",
            account.email,
            registration.cursor,
            registration.expires_at.to_rfc3339()
        );
        Ok(registration)
    }

    /// Stop the subscription. The local record is deactivated even when the
    /// upstream call fails.
    pub async fn revoke(&self, account_id: &str) -> Result<(), ServiceError> {
        let _guard = self.account_locks.lock(account_id.to_string()).await;
        let account = self.load(account_id)?;

        if let Err(e) = self
            .collab
            .retry
            .run("unsubscribe", || self.collab.provider.unsubscribe(&account))
            .await
        {
            tracing::warn!("Upstream watch stop failed for {}: {}", account.email, e);
        }

        self.collab
            .db
            .deactivate_watch(&account.id)
            .map_err(ServiceError::storage)?;
        tracing::info!("Watch revoked for {}", account.email);
        Ok(())
    }

    fn load(&self, account_id: &str) -> Result<AccountIntegration, ServiceError> {
        self.collab
            .db
            .get_integration(account_id)
            .map_err(ServiceError::storage)?
            .ok_or_else(|| ServiceError::NotFound(format!("integration {}", account_id)))
    }
}
