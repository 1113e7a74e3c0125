//! Cached username resolution with graceful degradation.

use super::content::is_line_safe;
use super::source_api::UserLookup;
use super::store::AccessStore;
use crate::config::UsernameConfig;
use crate::models::LinkedAccount;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Outcome of a best-effort batch refresh.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub changed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum RefreshOutcome {
    Changed,
    Unchanged,
    Failed,
}

pub struct UsernameResolver {
    store: Arc<dyn AccessStore>,
    lookup: Arc<dyn UserLookup>,
    config: UsernameConfig,
}

impl UsernameResolver {
    pub fn new(
        store: Arc<dyn AccessStore>,
        lookup: Arc<dyn UserLookup>,
        config: UsernameConfig,
    ) -> Self {
        Self {
            store,
            lookup,
            config,
        }
    }

    pub fn batch_concurrency(&self) -> usize {
        self.config.batch_concurrency.max(1)
    }

    /// Display name for `account`. Never fails: a failed refresh falls back
    /// to the last known name, or the raw account id.
    pub async fn resolve(&self, account: &LinkedAccount, now: DateTime<Utc>) -> String {
        if account.username_is_fresh(now, self.config.freshness) {
            if let Some(name) = &account.username {
                return name.clone();
            }
        }

        match self.refresh(account, now).await {
            Some(name) => name,
            None => account.fallback_name().to_string(),
        }
    }

    async fn refresh(&self, account: &LinkedAccount, now: DateTime<Utc>) -> Option<String> {
        let lookup = self.lookup.username(&account.account_id);
        let name = match tokio::time::timeout(self.config.lookup_timeout, lookup).await {
            Ok(Ok(name)) if is_line_safe(&name) => name,
            Ok(Ok(_)) => {
                metrics::counter!("username_lookups_total", "status" => "rejected").increment(1);
                tracing::warn!(
                    account_id = %account.account_id,
                    "Username contains reserved characters, using cached value"
                );
                return None;
            }
            Ok(Err(e)) => {
                metrics::counter!("username_lookups_total", "status" => "failed").increment(1);
                tracing::warn!(
                    account_id = %account.account_id,
                    error = %e,
                    "Username lookup failed, using cached value"
                );
                return None;
            }
            Err(_) => {
                metrics::counter!("username_lookups_total", "status" => "timeout").increment(1);
                tracing::warn!(
                    account_id = %account.account_id,
                    timeout_ms = self.config.lookup_timeout.as_millis() as u64,
                    "Username lookup timed out, using cached value"
                );
                return None;
            }
        };
        metrics::counter!("username_lookups_total", "status" => "ok").increment(1);

        if let Err(e) = self.store.set_username(&account.account_id, &name, now).await {
            // The fresh name is still good for this caller.
            tracing::warn!(
                account_id = %account.account_id,
                error = %e,
                "Failed to persist refreshed username"
            );
        }
        Some(name)
    }

    /// Refreshes every account with bounded concurrency. One failed lookup
    /// never affects its siblings.
    pub async fn refresh_batch(
        &self,
        accounts: Vec<LinkedAccount>,
        now: DateTime<Utc>,
    ) -> RefreshReport {
        let outcomes: Vec<RefreshOutcome> = stream::iter(accounts)
            .map(|account| async move {
                match self.refresh(&account, now).await {
                    Some(name) if account.username.as_deref() == Some(name.as_str()) => {
                        RefreshOutcome::Unchanged
                    }
                    Some(_) => RefreshOutcome::Changed,
                    None => RefreshOutcome::Failed,
                }
            })
            .buffer_unordered(self.batch_concurrency())
            .collect()
            .await;

        let mut report = RefreshReport::default();
        for outcome in outcomes {
            match outcome {
                RefreshOutcome::Changed => {
                    report.refreshed += 1;
                    report.changed += 1;
                }
                RefreshOutcome::Unchanged => report.refreshed += 1,
                RefreshOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    /// Batch refresh of every publishable account whose cache is stale.
    pub async fn refresh_stale(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RefreshReport, service_core::error::AppError> {
        let stale: Vec<LinkedAccount> = self
            .store
            .list_identities()
            .await?
            .into_iter()
            .flat_map(|identity| identity.accounts)
            .filter(|account| account.state.is_publishable())
            .filter(|account| !account.username_is_fresh(now, self.config.freshness))
            .collect();

        if stale.is_empty() {
            return Ok(RefreshReport::default());
        }

        tracing::info!(count = stale.len(), "Refreshing stale usernames");
        let report = self.refresh_batch(stale, now).await;
        tracing::info!(
            refreshed = report.refreshed,
            changed = report.changed,
            failed = report.failed,
            "Username refresh finished"
        );
        Ok(report)
    }
}
