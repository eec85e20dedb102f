use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::collaborators::Collaborators;
use crate::error::ServiceError;
use crate::subscription::SubscriptionManager;

const RENEWAL_FAILED_MESSAGE: &str =
    "⚠️ Your email notifications may have stopped working.\n\nUse /watch to re-enable them.";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RenewalReport {
    pub renewed: Vec<String>,
    /// Revoked after the sweep listed them.
    pub skipped: Vec<String>,
    pub failed: Vec<RenewalFailure>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RenewalFailure {
    pub email: String,
    pub error: String,
}

/// Re-registers every active subscription before it lapses.
pub struct RenewalScheduler {
    collab: Collaborators,
    subscriptions: Arc<SubscriptionManager>,
    interval: Duration,
    running: Mutex<()>,
}

impl RenewalScheduler {
    pub fn new(
        collab: Collaborators,
        subscriptions: Arc<SubscriptionManager>,
        interval: Duration,
    ) -> Self {
        Self {
            collab,
            subscriptions,
            interval,
            running: Mutex::new(()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One pass over all active accounts. Returns `None` when a previous pass
    /// is still running.
    pub async fn run_sweep(&self) -> Result<Option<RenewalReport>, ServiceError> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::warn!("Renewal sweep already in progress; skipping");
            return Ok(None);
        };

        let accounts = self
            .collab
            .db
            .list_active_integrations()
            .map_err(ServiceError::storage)?;
        tracing::info!("Renewing {} active watch(es)", accounts.len());

        let mut report = RenewalReport::default();
        for account in accounts {
            match self.subscriptions.renew(&account.id).await {
                Ok(None) => report.skipped.push(account.email),
                Ok(Some(registration)) => {
                    tracing::info!(
                        "Renewed watch for {} until {}",
                        account.email,
                        registration.expires_at.to_rfc3339()
                    );
                    report.renewed.push(account.email);
                }
                Err(e) => {
                    tracing::error!("Failed to renew watch for {}: {}", account.email, e);
                    if e.is_auth() {
                        self.collab.handle_auth_failure(&account, &e).await;
                    } else {
                        self.collab
                            .notify(account.conversation_id, RENEWAL_FAILED_MESSAGE)
                            .await;
                    }
                    report.failed.push(RenewalFailure {
                        email: account.email,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Watch renewal completed: {} renewed, {} skipped, {} failed",
            report.renewed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(Some(report))
    }

    /// Run a sweep every interval. The first sweep runs immediately so watches
    /// that lapsed while the process was down come back.
    pub async fn run_forever(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_sweep().await {
                tracing::error!("Watch renewal sweep failed: {}", e);
            }
        }
    }
}
