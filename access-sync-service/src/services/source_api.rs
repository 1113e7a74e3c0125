//! Typed access to the permission-source user directory.

use super::content::is_line_safe;
use super::throttle::{ThrottleError, ThrottledClient};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Account {0} does not exist")]
    UnknownAccount(String),

    #[error("Lookup request failed: {0}")]
    Request(#[from] ThrottleError),

    #[error("Unexpected lookup response: {0}")]
    InvalidResponse(String),

    #[error("Invalid source API URL: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait UserLookup: Send + Sync {
    /// Current username for an account on the authorized system.
    async fn username(&self, account_id: &str) -> Result<String, LookupError>;
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    name: String,
}

/// `GET {base}/v1/users/{id}` through the throttled client.
pub struct HttpUserLookup {
    client: ThrottledClient,
    base_url: String,
}

impl HttpUserLookup {
    pub fn new(client: ThrottledClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn user_url(&self, account_id: &str) -> Result<Url, LookupError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| LookupError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| LookupError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["v1", "users", account_id]);
        Ok(url)
    }
}

#[async_trait]
impl UserLookup for HttpUserLookup {
    async fn username(&self, account_id: &str) -> Result<String, LookupError> {
        let url = self.user_url(account_id)?;
        let response = match self.client.get(url.as_str()).await {
            Ok(response) => response,
            Err(e) if e.status() == Some(reqwest::StatusCode::NOT_FOUND) => {
                return Err(LookupError::UnknownAccount(account_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let user: UserResponse = response
            .json()
            .await
            .map_err(|e| LookupError::InvalidResponse(e.to_string()))?;

        if !is_line_safe(&user.name) {
            return Err(LookupError::InvalidResponse(format!(
                "unusable username for account {}",
                account_id
            )));
        }

        Ok(user.name)
    }
}

/// Fixed-table lookup used when no source API is reachable and in tests.
#[derive(Default)]
pub struct MockUserLookup {
    names: Mutex<HashMap<String, String>>,
    calls: AtomicU64,
}

impl MockUserLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_names<I, K, V>(names: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let lookup = Self::default();
        for (id, name) in names {
            lookup.set_name(id, name);
        }
        lookup
    }

    pub fn set_name(&self, account_id: impl Into<String>, name: impl Into<String>) {
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(account_id.into(), name.into());
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserLookup for MockUserLookup {
    async fn username(&self, account_id: &str) -> Result<String, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account_id)
            .cloned()
            .ok_or_else(|| LookupError::UnknownAccount(account_id.to_string()))
    }
}
