//! Atomic multi-file commits through the GitHub Git data API.
//!
//! Sequence: read the branch head and its tree, create one blob per file,
//! create a tree on top of the base tree, create the (optionally signed)
//! commit, then fast-forward the branch. A rejected fast-forward restarts
//! the sequence from the branch head.

use super::signing::{CommitSigner, SigningError};
use super::{ArtifactPublisher, PublishError, PublishFile, PublishReceipt, PublishRequest};
use crate::config::{CommitIdentity, GitHubConfig};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

const API_VERSION: &str = "2022-11-28";

enum SignerState {
    Disabled,
    Ready(CommitSigner),
    /// Configured but unusable; every publish goes out unsigned.
    Broken(SigningError),
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaObject,
}

#[derive(Debug, Deserialize)]
struct ShaObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaObject,
}

#[derive(Debug, Serialize)]
struct BlobRequest<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Debug, Serialize)]
struct TreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: String,
}

#[derive(Debug, Serialize)]
struct TreeRequest<'a> {
    base_tree: &'a str,
    tree: Vec<TreeEntry<'a>>,
}

#[derive(Debug, Clone, Serialize)]
struct GitPerson {
    name: String,
    email: String,
    date: String,
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    message: &'a str,
    tree: &'a str,
    parents: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<GitPerson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    committer: Option<GitPerson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateRefRequest<'a> {
    sha: &'a str,
    force: bool,
}

/// Raw commit object body exactly as Git serializes it for hashing.
pub fn commit_payload(
    tree_sha: &str,
    parent_sha: &str,
    author: &CommitIdentity,
    timestamp: DateTime<Utc>,
    message: &str,
) -> String {
    let person = format!(
        "{} <{}> {} +0000",
        author.name,
        author.email,
        timestamp.timestamp()
    );
    format!(
        "tree {}\nparent {}\nauthor {}\ncommitter {}\n\n{}",
        tree_sha, parent_sha, person, person, message
    )
}

pub struct GitDataPublisher {
    client: Client,
    config: GitHubConfig,
    signer: SignerState,
}

impl GitDataPublisher {
    pub fn new(config: GitHubConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("HTTP client: {}", e)))?;

        let signer = match CommitSigner::from_config(&config.signing) {
            Ok(None) => SignerState::Disabled,
            Ok(Some(signer)) => {
                tracing::info!(
                    public_key = %signer.public_key_openssh(),
                    "Commit signing enabled"
                );
                SignerState::Ready(signer)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Commit signing misconfigured, commits will be unsigned");
                SignerState::Broken(e)
            }
        };

        Ok(Self {
            client,
            config,
            signer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(self.config.token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        step: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, PublishError> {
        let response = self.authorized(builder).send().await?;
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(step, status = %status, "Git data API response");

        if !status.is_success() {
            return Err(PublishError::Api {
                step,
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| PublishError::InvalidResponse {
            step,
            message: e.to_string(),
        })
    }

    async fn head_sha(&self) -> Result<String, PublishError> {
        let url = self.url(&format!("git/ref/heads/{}", self.config.branch));
        let head: RefResponse = self.send("read branch head", self.client.get(url)).await?;
        Ok(head.object.sha)
    }

    async fn base_tree(&self, commit_sha: &str) -> Result<String, PublishError> {
        let url = self.url(&format!("git/commits/{}", commit_sha));
        let commit: CommitResponse = self.send("read base commit", self.client.get(url)).await?;
        Ok(commit.tree.sha)
    }

    async fn create_blob(&self, file: &PublishFile) -> Result<String, PublishError> {
        let body = BlobRequest {
            content: &file.content,
            encoding: "utf-8",
        };
        let blob: ShaObject = self
            .send("create blob", self.client.post(self.url("git/blobs")).json(&body))
            .await?;
        Ok(blob.sha)
    }

    async fn create_tree(
        &self,
        base_tree: &str,
        files: &[PublishFile],
    ) -> Result<String, PublishError> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            entries.push(TreeEntry {
                path: &file.path,
                mode: "100644",
                kind: "blob",
                sha: self.create_blob(file).await?,
            });
        }

        let body = TreeRequest {
            base_tree,
            tree: entries,
        };
        let tree: ShaObject = self
            .send("create tree", self.client.post(self.url("git/trees")).json(&body))
            .await?;
        Ok(tree.sha)
    }

    /// Signature over the canonical payload, or `None` with a warning.
    fn signature(
        &self,
        tree_sha: &str,
        parent_sha: &str,
        timestamp: DateTime<Utc>,
        message: &str,
    ) -> Option<String> {
        let signer = match &self.signer {
            SignerState::Disabled => return None,
            SignerState::Broken(e) => {
                tracing::warn!(error = %e, "Publishing unsigned commit");
                return None;
            }
            SignerState::Ready(signer) => signer,
        };
        let author = self.config.signing.author.as_ref()?;

        let payload = commit_payload(tree_sha, parent_sha, author, timestamp, message);
        match signer.sign(payload.as_bytes()) {
            Ok(signature) => Some(signature),
            Err(e) => {
                tracing::warn!(error = %e, "Commit signing failed, publishing unsigned commit");
                None
            }
        }
    }

    async fn create_commit(
        &self,
        tree_sha: &str,
        parent_sha: &str,
        message: &str,
    ) -> Result<(String, bool), PublishError> {
        // Git stores whole seconds; the signed payload must match.
        let timestamp = Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now);
        let person = self.config.signing.author.as_ref().map(|author| GitPerson {
            name: author.name.clone(),
            email: author.email.clone(),
            date: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        let signature = self.signature(tree_sha, parent_sha, timestamp, message);
        let signed = signature.is_some();

        let body = CommitRequest {
            message,
            tree: tree_sha,
            parents: vec![parent_sha],
            author: person.clone(),
            committer: person,
            signature,
        };
        let commit: ShaObject = self
            .send("create commit", self.client.post(self.url("git/commits")).json(&body))
            .await?;
        Ok((commit.sha, signed))
    }

    async fn update_ref(&self, commit_sha: &str) -> Result<(), PublishError> {
        let url = self.url(&format!("git/refs/heads/{}", self.config.branch));
        let body = UpdateRefRequest {
            sha: commit_sha,
            force: false,
        };
        let response = self
            .authorized(self.client.patch(url).json(&body))
            .send()
            .await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await?;
        if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(PublishError::Conflict(body));
        }
        Err(PublishError::Api {
            step: "update branch ref",
            status: status.as_u16(),
            body,
        })
    }

    async fn attempt(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let head = self.head_sha().await?;
        let base_tree = self.base_tree(&head).await?;
        let tree = self.create_tree(&base_tree, &request.files).await?;
        let (commit_sha, signed) = self.create_commit(&tree, &head, &request.message).await?;
        self.update_ref(&commit_sha).await?;
        Ok(PublishReceipt { commit_sha, signed })
    }
}

#[async_trait]
impl ArtifactPublisher for GitDataPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let attempts = self.config.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            match self.attempt(request).await {
                Ok(receipt) => {
                    tracing::info!(
                        commit_sha = %receipt.commit_sha,
                        signed = receipt.signed,
                        branch = %self.config.branch,
                        attempt,
                        "Published whitelist commit"
                    );
                    return Ok(receipt);
                }
                Err(PublishError::Conflict(reason)) => {
                    tracing::warn!(
                        attempt,
                        reason = %reason,
                        "Branch moved during publish, restarting from branch head"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(PublishError::ConflictRetriesExhausted { attempts })
    }

    fn target(&self) -> String {
        format!(
            "{}/{}@{}",
            self.config.owner, self.config.repo, self.config.branch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_matches_git_commit_serialization() {
        let author = CommitIdentity {
            name: "Access Bot".to_string(),
            email: "bot@example.com".to_string(),
        };
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let payload = commit_payload("t1", "p1", &author, timestamp, "Updated access");

        assert_eq!(
            payload,
            "tree t1\n\
             parent p1\n\
             author Access Bot <bot@example.com> 1704164645 +0000\n\
             committer Access Bot <bot@example.com> 1704164645 +0000\n\
             \n\
             Updated access"
        );
    }
}
