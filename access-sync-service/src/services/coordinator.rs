//! Debounced publishing.
//!
//! Policy diffs are applied to the store immediately; publishing waits until
//! the trigger stream has been quiet for one window, then runs a single
//! Generate -> Encode -> Publish cycle over the current store state. At most
//! one cycle is in flight; triggers that arrive during a cycle re-arm the
//! window once it completes. A failed cycle re-arms itself with a doubling
//! delay, capped, until a publish succeeds.

use super::codec::{self, CodecKeys};
use super::content::ContentGenerator;
use super::policy::{AccessPolicyEngine, PolicyOutcome};
use super::publisher::{ArtifactPublisher, PublishFile, PublishReceipt, PublishRequest};
use crate::models::MembershipEvent;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending { deadline: Instant },
    Publishing { rearm: bool },
}

const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Pure transition table; the driver task feeds it the clock.
#[derive(Debug, Clone)]
pub struct DebounceMachine {
    state: DebounceState,
    window: Duration,
    retry_max_delay: Duration,
    failures: u32,
}

impl DebounceMachine {
    pub fn new(window: Duration) -> Self {
        Self {
            state: DebounceState::Idle,
            window,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            failures: 0,
        }
    }

    pub fn with_retry_max_delay(mut self, retry_max_delay: Duration) -> Self {
        self.retry_max_delay = retry_max_delay;
        self
    }

    /// Consecutive failed cycles since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn trigger(&mut self, now: Instant) {
        self.state = match self.state {
            DebounceState::Idle | DebounceState::Pending { .. } => DebounceState::Pending {
                deadline: now + self.window,
            },
            DebounceState::Publishing { .. } => DebounceState::Publishing { rearm: true },
        };
    }

    /// True when the caller should start a publish cycle now.
    pub fn timer_fired(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::Pending { deadline } if now >= deadline => {
                self.state = DebounceState::Publishing { rearm: false };
                true
            }
            _ => false,
        }
    }

    pub fn publish_complete(&mut self, now: Instant) {
        self.failures = 0;
        self.state = match self.state {
            DebounceState::Publishing { rearm: true } => DebounceState::Pending {
                deadline: now + self.window,
            },
            DebounceState::Publishing { rearm: false } => DebounceState::Idle,
            other => other,
        };
    }

    /// Schedules a retry whatever arrived meanwhile; returns the delay.
    pub fn publish_failed(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.retry_delay();
        if let DebounceState::Publishing { .. } = self.state {
            self.state = DebounceState::Pending {
                deadline: now + delay,
            };
        }
        delay
    }

    /// `window * 2^(failures - 1)`, capped at the retry ceiling but never
    /// shorter than the window.
    fn retry_delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(16);
        self.window
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
            .max(self.window)
    }
}

/// Commit message for a coalesced window.
pub fn commit_message(summaries: &[String]) -> String {
    match summaries {
        [] => "Refresh access list".to_string(),
        [single] => single.clone(),
        many => format!(
            "Updated access for {} members\n\n{}",
            many.len(),
            many.join("\n")
        ),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub plaintext: String,
    pub encoded: String,
}

/// Generate -> Encode -> Publish.
pub struct PublishPipeline {
    pub generator: Arc<ContentGenerator>,
    pub publisher: Arc<dyn ArtifactPublisher>,
    pub keys: CodecKeys,
    pub community_id: Option<String>,
    pub plaintext_path: String,
    pub encoded_path: String,
}

impl PublishPipeline {
    pub async fn render(&self, now: DateTime<Utc>) -> Result<Artifacts, AppError> {
        let plaintext = self.generator.generate(now).await?;
        let key = self
            .keys
            .resolve(self.community_id.as_deref())
            .map_err(|e| AppError::ConfigError(e.into()))?;
        let encoded =
            codec::encode(&plaintext, key).map_err(|e| AppError::ConfigError(e.into()))?;
        Ok(Artifacts { plaintext, encoded })
    }

    pub async fn run(&self, message: String) -> Result<PublishReceipt, AppError> {
        let artifacts = self.render(Utc::now()).await?;
        let request = PublishRequest {
            message,
            files: vec![
                PublishFile {
                    path: self.plaintext_path.clone(),
                    content: artifacts.plaintext,
                },
                PublishFile {
                    path: self.encoded_path.clone(),
                    content: artifacts.encoded,
                },
            ],
        };

        self.publisher
            .publish(&request)
            .await
            .map_err(|e| AppError::BadGateway(e.to_string()))
    }
}

/// Summary waiting for the next publish; keyed so repeated changes to one
/// identity collapse to the latest.
#[derive(Debug, Clone)]
struct PendingChange {
    identity_id: Option<String>,
    summary: String,
}

struct Inner {
    policy: Arc<AccessPolicyEngine>,
    pipeline: PublishPipeline,
    machine: Mutex<DebounceMachine>,
    pending: Mutex<Vec<PendingChange>>,
    notify: Notify,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct PublishCoordinator {
    inner: Arc<Inner>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PublishCoordinator {
    /// Builds the coordinator and spawns its driver task.
    pub fn spawn(
        policy: Arc<AccessPolicyEngine>,
        pipeline: PublishPipeline,
        window: Duration,
        retry_max_delay: Duration,
    ) -> Self {
        let machine = DebounceMachine::new(window).with_retry_max_delay(retry_max_delay);
        let inner = Arc::new(Inner {
            policy,
            pipeline,
            machine: Mutex::new(machine),
            pending: Mutex::new(Vec::new()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        });

        tracing::info!(
            window_ms = window.as_millis() as u64,
            target = %inner.pipeline.publisher.target(),
            "Starting publish coordinator"
        );
        let handle = tokio::spawn(inner.clone().drive());

        Self {
            inner,
            driver: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn pipeline(&self) -> &PublishPipeline {
        &self.inner.pipeline
    }

    pub async fn state(&self) -> DebounceState {
        self.inner.machine.lock().await.state()
    }

    /// Applies the policy diff now and schedules a publish if anything changed.
    pub async fn handle_event(&self, event: &MembershipEvent) -> Result<PolicyOutcome, AppError> {
        let outcome = self.inner.policy.apply(event).await?;
        self.record(&outcome).await;
        Ok(outcome)
    }

    pub async fn record(&self, outcome: &PolicyOutcome) {
        if !outcome.changed() {
            return;
        }
        self.inner
            .enqueue(Some(outcome.identity_id.clone()), outcome.summary.clone())
            .await;
    }

    /// Arms (or re-arms) the window with a free-form summary.
    pub async fn trigger(&self, summary: impl Into<String>) {
        self.inner.enqueue(None, summary.into()).await;
    }

    /// Stops the driver. A pending window is published first; a crash loses it.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Publish coordinator task failed");
            }
        }
    }
}

impl Inner {
    async fn enqueue(&self, identity_id: Option<String>, summary: String) {
        {
            let mut pending = self.pending.lock().await;
            if let Some(id) = &identity_id {
                pending.retain(|c| c.identity_id.as_ref() != Some(id));
            }
            pending.push(PendingChange {
                identity_id,
                summary,
            });
        }
        self.machine.lock().await.trigger(Instant::now());
        self.notify.notify_one();
    }

    async fn drive(self: Arc<Self>) {
        loop {
            let deadline = self.machine.lock().await.deadline();
            let fired = match deadline {
                Some(deadline) => tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => true,
                    _ = self.notify.notified() => false,
                    _ = self.cancel.cancelled() => break,
                },
                None => tokio::select! {
                    _ = self.notify.notified() => false,
                    _ = self.cancel.cancelled() => break,
                },
            };

            if fired {
                let start = self.machine.lock().await.timer_fired(Instant::now());
                if start {
                    self.cycle().await;
                }
            }
        }

        // Flush a window that was still waiting when shutdown began.
        let flush = {
            let mut machine = self.machine.lock().await;
            match machine.state() {
                DebounceState::Pending { deadline } => machine.timer_fired(deadline),
                _ => false,
            }
        };
        if flush {
            tracing::info!("Flushing pending publish before shutdown");
            self.cycle().await;
        }
        tracing::info!("Publish coordinator stopped");
    }

    async fn cycle(&self) {
        let changes: Vec<PendingChange> = std::mem::take(&mut *self.pending.lock().await);
        let summaries: Vec<String> = changes.iter().map(|c| c.summary.clone()).collect();
        let message = commit_message(&summaries);

        let started = std::time::Instant::now();
        let published = match self.pipeline.run(message).await {
            Ok(receipt) => {
                metrics::counter!("whitelist_publish_total", "status" => "success").increment(1);
                tracing::info!(
                    commit_sha = %receipt.commit_sha,
                    signed = receipt.signed,
                    changes = changes.len(),
                    "Whitelist published"
                );
                true
            }
            Err(e) => {
                metrics::counter!("whitelist_publish_total", "status" => "failure").increment(1);
                tracing::error!(
                    error = %e,
                    changes = changes.len(),
                    "Whitelist publish failed, store remains authoritative"
                );
                // Keep the summaries for the next successful commit.
                let mut pending = self.pending.lock().await;
                let newer = std::mem::take(&mut *pending);
                *pending = changes;
                for change in newer {
                    if let Some(id) = &change.identity_id {
                        pending.retain(|c| c.identity_id.as_ref() != Some(id));
                    }
                    pending.push(change);
                }
                false
            }
        };
        metrics::histogram!("whitelist_publish_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let mut machine = self.machine.lock().await;
        if published {
            machine.publish_complete(Instant::now());
        } else {
            let retry_in = machine.publish_failed(Instant::now());
            tracing::warn!(
                retry_in_ms = retry_in.as_millis() as u64,
                failures = machine.failures(),
                "Publish retry scheduled"
            );
        }
    }
}
