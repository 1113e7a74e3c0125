//! Canonical plaintext authorization list.

use super::codec::normalize;
use super::store::AccessStore;
use super::usernames::UsernameResolver;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use service_core::error::AppError;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Characters that would break the published line format.
pub const RESERVED: &[char] = &[',', ':', '|', '\n', '\r'];

/// True when `value` can be written into a line without changing its shape.
pub fn is_line_safe(value: &str) -> bool {
    !value.trim().is_empty() && !value.contains(RESERVED)
}

/// One published line before formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct WhitelistEntry {
    pub identity_id: String,
    pub account_id: String,
    pub display_name: String,
    pub permissions: BTreeSet<String>,
}

impl WhitelistEntry {
    /// `None` when neither the display name nor the account id is line-safe.
    fn line(&self) -> Option<String> {
        let name = [self.display_name.as_str(), self.account_id.as_str()]
            .into_iter()
            .find(|candidate| is_line_safe(candidate))?;
        let permissions: Vec<&str> = self.permissions.iter().map(String::as_str).collect();
        Some(format!("{},{}", name, permissions.join(":")))
    }
}

/// `<name>,<perm>:<perm>` lines ordered by identity then account, `\n`-joined.
pub fn render(entries: &[WhitelistEntry]) -> String {
    let mut sorted: Vec<&WhitelistEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        (a.identity_id.as_str(), a.account_id.as_str())
            .cmp(&(b.identity_id.as_str(), b.account_id.as_str()))
    });

    let lines: Vec<String> = sorted
        .iter()
        .filter_map(|entry| {
            let line = entry.line();
            if line.is_none() {
                tracing::warn!(
                    identity_id = %entry.identity_id,
                    account_id = %entry.account_id,
                    "Skipping entry with no usable name"
                );
            }
            line
        })
        .collect();
    normalize(&lines.join("\n"))
}

pub struct ContentGenerator {
    store: Arc<dyn AccessStore>,
    resolver: Arc<UsernameResolver>,
}

impl ContentGenerator {
    pub fn new(store: Arc<dyn AccessStore>, resolver: Arc<UsernameResolver>) -> Self {
        Self { store, resolver }
    }

    /// Entries for every publishable account of every identity holding at
    /// least one active grant with a non-empty permission set.
    pub async fn entries(&self, now: DateTime<Utc>) -> Result<Vec<WhitelistEntry>, AppError> {
        let permissions_by_role: HashMap<String, BTreeSet<String>> = self
            .store
            .list_roles()
            .await?
            .into_iter()
            .map(|role| (role.id, role.permissions))
            .collect();

        let records = self.store.list_records().await?;
        let mut permissions_by_identity: HashMap<String, BTreeSet<String>> = HashMap::new();
        for record in records {
            let permissions: BTreeSet<String> = record
                .active_role_ids(now)
                .iter()
                .filter_map(|role_id| permissions_by_role.get(role_id))
                .flatten()
                .cloned()
                .collect();
            if !permissions.is_empty() {
                permissions_by_identity.insert(record.identity_id, permissions);
            }
        }

        let pending: Vec<_> = self
            .store
            .list_identities()
            .await?
            .into_iter()
            .filter_map(|identity| {
                let permissions = permissions_by_identity.get(&identity.id)?.clone();
                Some((identity, permissions))
            })
            .flat_map(|(identity, permissions)| {
                identity
                    .publishable_accounts()
                    .cloned()
                    .map(|account| (identity.id.clone(), account, permissions.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let resolver = &self.resolver;
        let entries: Vec<WhitelistEntry> = stream::iter(pending)
            .map(|(identity_id, account, permissions)| async move {
                let display_name = resolver.resolve(&account, now).await;
                WhitelistEntry {
                    identity_id,
                    account_id: account.account_id,
                    display_name,
                    permissions,
                }
            })
            .buffered(resolver.batch_concurrency())
            .collect()
            .await;

        Ok(entries)
    }

    pub async fn generate(&self, now: DateTime<Utc>) -> Result<String, AppError> {
        let entries = self.entries(now).await?;
        let content = render(&entries);
        tracing::debug!(lines = entries.len(), bytes = content.len(), "Generated whitelist");
        Ok(content)
    }
}
