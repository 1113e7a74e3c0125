//! Serialized, quota-aware HTTP client for the permission-source API.
//!
//! Every call goes through one FIFO queue owned by a single drain task, so
//! spacing and quota bookkeeping never race. Callers enqueue from any task and
//! await their reply.

use crate::config::{QuotaTiers, SourceApiConfig};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::HeaderMap, Client, Request, Response, StatusCode};
use service_core::error::AppError;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const REMAINING_HEADERS: [&str; 2] = ["x-ratelimit-remaining", "ratelimit-remaining"];
const RESET_HEADERS: [&str; 2] = ["x-ratelimit-reset", "ratelimit-reset"];

/// Reset values at or above this are unix timestamps rather than deltas.
const EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// Ceiling for any wait derived from a response header.
pub const MAX_HEADER_WAIT: Duration = Duration::from_secs(60 * 60);

/// Header seconds as a `Duration`, clamped to [`MAX_HEADER_WAIT`].
fn header_wait(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0))
        .map_or(MAX_HEADER_WAIT, |wait| wait.min(MAX_HEADER_WAIT))
}

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("{method} {url} failed after {attempts} attempts (last status {last_status})")]
    RetriesExhausted {
        method: String,
        url: String,
        attempts: u32,
        last_status: StatusCode,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request to {0} has a streaming body and cannot be retried")]
    NotReplayable(String),

    #[error("Throttled client is shut down")]
    Closed,
}

impl ThrottleError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ThrottleError::RetriesExhausted { last_status, .. } => Some(*last_status),
            ThrottleError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Point-in-time view of the server-reported quota.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuotaSnapshot {
    pub remaining: Option<u32>,
    pub reset_in: Option<Duration>,
}

#[derive(Debug, Default)]
struct QuotaState {
    remaining: Option<u32>,
    reset_at: Option<Instant>,
}

impl QuotaState {
    fn observe(&mut self, headers: &HeaderMap, now: Instant, wall: DateTime<Utc>) {
        if let Some(remaining) = header_number(headers, &REMAINING_HEADERS) {
            self.remaining = Some(remaining.max(0.0).min(u32::MAX as f64) as u32);
        }
        if let Some(reset) = header_number(headers, &RESET_HEADERS) {
            let delta = if reset >= EPOCH_THRESHOLD_SECS {
                (reset - wall.timestamp() as f64).max(0.0)
            } else {
                reset.max(0.0)
            };
            if let Some(reset_at) = now.checked_add(header_wait(delta)) {
                self.reset_at = Some(reset_at);
            }
        }
    }

    /// Extra wait before the next call given what the server last reported.
    fn delay(&self, tiers: &QuotaTiers, now: Instant) -> Duration {
        match self.remaining {
            Some(0) => self
                .reset_at
                .map(|reset| reset.saturating_duration_since(now))
                .filter(|wait| !wait.is_zero())
                .unwrap_or(tiers.critical),
            Some(remaining) => tiers.delay_for(remaining),
            None => Duration::ZERO,
        }
    }

    fn snapshot(&self, now: Instant) -> QuotaSnapshot {
        QuotaSnapshot {
            remaining: self.remaining,
            reset_in: self.reset_at.map(|reset| reset.saturating_duration_since(now)),
        }
    }
}

fn header_number(headers: &HeaderMap, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|name| {
        headers
            .get(*name)?
            .to_str()
            .ok()?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    })
}

/// Parses a `Retry-After` value: delta seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| header_wait(secs));
    }
    DateTime::parse_from_rfc2822(value).ok().map(|at| {
        (at.with_timezone(&Utc) - now)
            .to_std()
            .map_or(Duration::ZERO, |wait| wait.min(MAX_HEADER_WAIT))
    })
}

struct Job {
    request: Request,
    attempts: u32,
    backoff: Option<ExponentialBackoff>,
    reply: oneshot::Sender<Result<Response, ThrottleError>>,
}

impl Job {
    fn next_backoff(&mut self, config: &SourceApiConfig) -> Duration {
        self.backoff
            .get_or_insert_with(|| backoff_policy(config))
            .next_backoff()
            .unwrap_or(config.max_delay)
    }

    fn respond(self, result: Result<Response, ThrottleError>) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply.send(result);
    }
}

fn backoff_policy(config: &SourceApiConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: config.base_delay,
        current_interval: config.base_delay,
        max_interval: config.max_delay,
        multiplier: 2.0,
        randomization_factor: 0.1,
        max_elapsed_time: None,
        ..Default::default()
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Handle to the drain task. Cheap to clone.
#[derive(Clone)]
pub struct ThrottledClient {
    http: Client,
    tx: mpsc::UnboundedSender<Job>,
    quota: Arc<RwLock<QuotaState>>,
    shutdown: CancellationToken,
}

impl ThrottledClient {
    /// Builds the client and spawns its drain task; must run inside a Tokio
    /// runtime.
    pub fn new(config: SourceApiConfig) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("access-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let quota = Arc::new(RwLock::new(QuotaState::default()));
        let shutdown = CancellationToken::new();

        let limiter = Quota::with_period(config.min_interval).map(DirectLimiter::direct);

        let drainer = Drainer {
            http: http.clone(),
            config,
            limiter,
            quota: quota.clone(),
            rx,
            queue: VecDeque::new(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(drainer.run());

        Ok(Self {
            http,
            tx,
            quota,
            shutdown,
        })
    }

    pub async fn execute(&self, request: Request) -> Result<Response, ThrottleError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Job {
                request,
                attempts: 0,
                backoff: None,
                reply,
            })
            .map_err(|_| ThrottleError::Closed)?;

        response.await.map_err(|_| ThrottleError::Closed)?
    }

    pub async fn get(&self, url: &str) -> Result<Response, ThrottleError> {
        let request = self.http.get(url).build()?;
        self.execute(request).await
    }

    pub fn quota(&self) -> QuotaSnapshot {
        self.quota
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .snapshot(Instant::now())
    }

    /// Stops the drain task; queued calls are rejected with `Closed`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

struct Drainer {
    http: Client,
    config: SourceApiConfig,
    limiter: Option<DirectLimiter>,
    quota: Arc<RwLock<QuotaState>>,
    rx: mpsc::UnboundedReceiver<Job>,
    queue: VecDeque<Job>,
    shutdown: CancellationToken,
}

impl Drainer {
    async fn run(mut self) {
        tracing::debug!(
            min_interval_ms = self.config.min_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Source API drain loop started"
        );

        loop {
            // Pull everything already submitted so ordering stays FIFO.
            while let Ok(job) = self.rx.try_recv() {
                self.queue.push_back(job);
            }

            let job = match self.queue.pop_front() {
                Some(job) => job,
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    next = self.rx.recv() => match next {
                        Some(job) => job,
                        None => break,
                    },
                },
            };

            if self.shutdown.is_cancelled() {
                job.respond(Err(ThrottleError::Closed));
                break;
            }

            self.process(job).await;
        }

        self.rx.close();
        while let Ok(job) = self.rx.try_recv() {
            self.queue.push_back(job);
        }
        for job in self.queue.drain(..) {
            job.respond(Err(ThrottleError::Closed));
        }
        tracing::debug!("Source API drain loop stopped");
    }

    async fn pace(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let extra = self
            .quota
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .delay(&self.config.quota_tiers, Instant::now())
            .min(self.config.max_retry_after);
        if !extra.is_zero() {
            tracing::debug!(delay_ms = extra.as_millis() as u64, "Backing off for low quota");
            tokio::time::sleep(extra).await;
        }
    }

    async fn process(&mut self, mut job: Job) {
        if job.reply.is_closed() {
            return;
        }

        let url = job.request.url().to_string();
        let method = job.request.method().to_string();
        let Some(request) = job.request.try_clone() else {
            job.respond(Err(ThrottleError::NotReplayable(url)));
            return;
        };

        self.pace().await;

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                metrics::counter!("source_api_requests_total", "status" => "transport_error")
                    .increment(1);
                tracing::warn!(url = %url, error = %e, "Source API transport error");
                job.respond(Err(ThrottleError::Transport(e)));
                return;
            }
        };

        let status = response.status();
        metrics::counter!("source_api_requests_total", "status" => status.as_u16().to_string())
            .increment(1);
        self.quota
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observe(response.headers(), Instant::now(), Utc::now());

        if status.is_success() {
            job.respond(Ok(response));
            return;
        }

        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS;
        if !rate_limited && !status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(url = %url, status = %status, "Source API rejected request");
            job.respond(Err(ThrottleError::Status { url, status, body }));
            return;
        }

        let retry_after = if rate_limited {
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()))
        } else {
            None
        };

        // Waiting out a long Retry-After would stall every queued caller.
        let wait_too_long = retry_after.is_some_and(|wait| wait > self.config.max_retry_after);
        if job.attempts >= self.config.max_retries || wait_too_long {
            let attempts = job.attempts + 1;
            tracing::warn!(
                url = %url,
                status = %status,
                attempts,
                retry_after_ms = retry_after.map(|wait| wait.as_millis() as u64),
                "Source API call failed, giving up"
            );
            job.respond(Err(ThrottleError::RetriesExhausted {
                method,
                url,
                attempts,
                last_status: status,
            }));
            return;
        }

        let delay = match retry_after {
            Some(wait) => wait,
            None => job.next_backoff(&self.config),
        };

        let reason = if rate_limited { "rate_limited" } else { "server_error" };
        metrics::counter!("source_api_retries_total", "reason" => reason).increment(1);
        tracing::warn!(
            url = %url,
            status = %status,
            attempt = job.attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Source API call failed, re-queueing at front"
        );

        job.attempts += 1;
        tokio::time::sleep(delay).await;
        self.queue.push_front(job);
    }
}
