//! Account bindings and credential lookup.
//!
//! An account is one business endpoint (a page) with its own token and
//! independent push/sweep switches. The service only reads credentials;
//! storage and rotation belong to whoever writes the accounts file.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

fn default_true() -> bool {
    true
}

/// One account entry from the accounts file.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountBinding {
    pub account_id: String,
    pub platform: String,
    #[serde(default)]
    pub name: Option<String>,
    pub access_token: SecretString,
    #[serde(default = "default_true")]
    pub push_enabled: bool,
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,
}

/// All configured accounts, keyed by account id.
#[derive(Debug, Clone, Default)]
pub struct AccountDirectory {
    accounts: Vec<AccountBinding>,
}

impl AccountDirectory {
    pub fn new(accounts: Vec<AccountBinding>) -> Self {
        Self { accounts }
    }

    /// Load bindings from a JSON array file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let accounts: Vec<AccountBinding> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;

        let mut seen = std::collections::HashSet::new();
        for account in &accounts {
            if account.account_id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "account_id".into(),
                    message: format!("empty account id in {}", path.display()),
                });
            }
            if !seen.insert(account.account_id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "account_id".into(),
                    message: format!("duplicate account {}", account.account_id),
                });
            }
        }
        Ok(Self { accounts })
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountBinding> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }

    pub fn all(&self) -> &[AccountBinding] {
        &self.accounts
    }

    /// Accounts the sweep should scan, in file order.
    pub fn sweep_accounts(&self) -> impl Iterator<Item = &AccountBinding> {
        self.accounts.iter().filter(|a| a.sweep_enabled)
    }

    /// Whether push events for this account should be processed. Unknown
    /// accounts are not processed.
    pub fn push_enabled(&self, account_id: &str) -> bool {
        self.get(account_id).is_some_and(|a| a.push_enabled)
    }

    pub fn sweep_enabled(&self, account_id: &str) -> bool {
        self.get(account_id).is_some_and(|a| a.sweep_enabled)
    }

    /// Credential store backed by the tokens in this directory.
    pub fn credential_store(&self) -> StaticCredentialStore {
        StaticCredentialStore::new(
            self.accounts
                .iter()
                .map(|a| (a.account_id.clone(), a.access_token.clone())),
        )
    }
}

/// Credential lookup by account id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, account_id: &str) -> Option<SecretString>;
}

/// In-memory credential table built at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    tokens: HashMap<String, SecretString>,
}

impl StaticCredentialStore {
    pub fn new(tokens: impl IntoIterator<Item = (String, SecretString)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn get_credential(&self, account_id: &str) -> Option<SecretString> {
        self.tokens.get(account_id).cloned()
    }
}
