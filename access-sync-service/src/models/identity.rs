use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an account on the authorized system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountState {
    Unverified,
    InVerification,
    Main,
    Alt,
}

impl AccountState {
    /// Accounts mid-verification are never published.
    pub fn is_publishable(self) -> bool {
        !matches!(self, AccountState::InVerification)
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountState::Unverified => write!(f, "UNVERIFIED"),
            AccountState::InVerification => write!(f, "IN_VERIFICATION"),
            AccountState::Main => write!(f, "MAIN"),
            AccountState::Alt => write!(f, "ALT"),
        }
    }
}

impl std::str::FromStr for AccountState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UNVERIFIED" => Ok(AccountState::Unverified),
            "IN_VERIFICATION" => Ok(AccountState::InVerification),
            "MAIN" => Ok(AccountState::Main),
            "ALT" => Ok(AccountState::Alt),
            _ => Err(format!("Invalid account state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkedAccount {
    pub account_id: String,
    pub state: AccountState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_refreshed_utc: Option<DateTime<Utc>>,
}

impl LinkedAccount {
    pub fn new(account_id: impl Into<String>, state: AccountState) -> Self {
        Self {
            account_id: account_id.into(),
            state,
            username: None,
            username_refreshed_utc: None,
        }
    }

    pub fn username_is_fresh(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        match (&self.username, self.username_refreshed_utc) {
            (Some(_), Some(refreshed)) => now - refreshed < freshness,
            _ => false,
        }
    }

    /// Last known name, or the raw account id if it was never resolved.
    pub fn fallback_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.account_id)
    }
}

/// An internal account keyed by the platform's stable user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub accounts: Vec<LinkedAccount>,
    pub created_utc: DateTime<Utc>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            accounts: Vec::new(),
            created_utc: Utc::now(),
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn publishable_accounts(&self) -> impl Iterator<Item = &LinkedAccount> {
        self.accounts.iter().filter(|a| a.state.is_publishable())
    }

    /// Inserts the account or moves an existing one to `state`.
    pub fn upsert_account(&mut self, account_id: &str, state: AccountState) {
        match self.accounts.iter_mut().find(|a| a.account_id == account_id) {
            Some(account) => account.state = state,
            None => self.accounts.push(LinkedAccount::new(account_id, state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_verification_is_not_publishable() {
        assert!(AccountState::Unverified.is_publishable());
        assert!(AccountState::Main.is_publishable());
        assert!(AccountState::Alt.is_publishable());
        assert!(!AccountState::InVerification.is_publishable());
    }

    #[test]
    fn account_state_parses_case_insensitively() {
        assert_eq!("main".parse::<AccountState>(), Ok(AccountState::Main));
        assert_eq!(
            "IN_VERIFICATION".parse::<AccountState>(),
            Ok(AccountState::InVerification)
        );
        assert!("pending".parse::<AccountState>().is_err());
    }

    #[test]
    fn freshness_requires_name_and_timestamp() {
        let now = Utc::now();
        let mut account = LinkedAccount::new("42", AccountState::Main);
        assert!(!account.username_is_fresh(now, Duration::days(7)));

        account.username = Some("builderman".to_string());
        account.username_refreshed_utc = Some(now - Duration::days(1));
        assert!(account.username_is_fresh(now, Duration::days(7)));

        account.username_refreshed_utc = Some(now - Duration::days(8));
        assert!(!account.username_is_fresh(now, Duration::days(7)));
    }

    #[test]
    fn upsert_account_updates_in_place() {
        let mut identity = Identity::new("user-1");
        identity.upsert_account("42", AccountState::InVerification);
        identity.upsert_account("42", AccountState::Main);
        assert_eq!(identity.accounts.len(), 1);
        assert_eq!(identity.accounts[0].state, AccountState::Main);
    }
}
