pub mod github;
pub mod signing;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub use github::GitDataPublisher;
pub use signing::{CommitSigner, SigningError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Branch moved during publish: {0}")]
    Conflict(String),

    #[error("Gave up after {attempts} conflicting ref updates")]
    ConflictRetriesExhausted { attempts: u32 },

    #[error("{step} failed with status {status}: {body}")]
    Api {
        step: &'static str,
        status: u16,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected response from {step}: {message}")]
    InvalidResponse { step: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishFile {
    pub path: String,
    pub content: String,
}

/// Files committed together under one message.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub message: String,
    pub files: Vec<PublishFile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub commit_sha: String,
    pub signed: bool,
}

#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError>;

    /// Human-readable destination, for logs.
    fn target(&self) -> String;
}

/// Records publishes in memory. Used when no remote is configured.
#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<PublishRequest>>,
    delay: Option<Duration>,
    failures: AtomicU32,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each publish takes `delay` before completing.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// The next `count` publishes fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published().len()
    }
}

#[async_trait]
impl ArtifactPublisher for MockPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError::Api {
                step: "mock publish",
                status: 503,
                body: "injected failure".to_string(),
            });
        }

        let mut published = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        published.push(request.clone());

        tracing::info!(
            files = request.files.len(),
            message = %request.message,
            "[MOCK] Whitelist would be published"
        );

        Ok(PublishReceipt {
            commit_sha: format!("mock-{}", published.len()),
            signed: false,
        })
    }

    fn target(&self) -> String {
        "mock".to_string()
    }
}
