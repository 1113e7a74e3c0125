use super::coordinator::PublishCoordinator;
use super::store::AccessStore;
use super::usernames::UsernameResolver;
use crate::models::AuthorizationRecord;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Grants whose expiry falls in `(since, now]`.
pub fn grants_expired_between(
    records: &[AuthorizationRecord],
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> usize {
    records
        .iter()
        .flat_map(|record| record.grants.iter())
        .filter_map(|grant| grant.expires_utc)
        .filter(|expires| *expires > since && *expires <= now)
        .count()
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Periodically refreshes stale usernames; a changed name republishes.
pub fn spawn_username_refresh(
    resolver: Arc<UsernameResolver>,
    coordinator: PublishCoordinator,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(period_secs = period.as_secs(), "Starting username refresh job");
        let mut interval = ticker(period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Username refresh job shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match resolver.refresh_stale(Utc::now()).await {
                        Ok(report) if report.changed > 0 => {
                            coordinator
                                .trigger(format!("Refreshed {} usernames", report.changed))
                                .await;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Username refresh failed"),
                    }
                }
            }
        }
    })
}

/// Republishes when a time-limited grant lapses, since expiry changes the
/// list without any event.
pub fn spawn_expiry_sweep(
    store: Arc<dyn AccessStore>,
    coordinator: PublishCoordinator,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(period_secs = period.as_secs(), "Starting grant expiry sweep");
        let mut interval = ticker(period);
        let mut last_sweep = Utc::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Grant expiry sweep shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    match store.list_records().await {
                        Ok(records) => {
                            let expired = grants_expired_between(&records, last_sweep, now);
                            if expired > 0 {
                                tracing::info!(expired, "Grants expired since last sweep");
                                coordinator
                                    .trigger(format!("{} time-limited grants expired", expired))
                                    .await;
                            }
                            last_sweep = now;
                        }
                        Err(e) => tracing::error!(error = %e, "Grant expiry sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Grant;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn counts_only_grants_crossing_the_window() {
        let now = Utc::now();
        let since = now - ChronoDuration::minutes(1);

        let mut record = AuthorizationRecord::new("u1");
        record.put_grant(Grant::new("old", Some(now - ChronoDuration::hours(1))));
        record.put_grant(Grant::new("just-lapsed", Some(now - ChronoDuration::seconds(10))));
        record.put_grant(Grant::new("future", Some(now + ChronoDuration::hours(1))));
        record.put_grant(Grant::new("permanent", None));

        assert_eq!(grants_expired_between(&[record], since, now), 1);
    }
}
