//! Explicit platform → transport table plus the outbound facade.
//!
//! Built once in `main` and passed by `Arc` to the pipeline and the sweep.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;

use crate::channels::{CredentialStore, PlatformTransport};
use crate::error::TransportError;

/// Platform name → transport.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    transports: HashMap<String, Arc<dyn PlatformTransport>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its own platform name.
    pub fn register(&mut self, transport: Arc<dyn PlatformTransport>) -> &mut Self {
        self.transports
            .insert(transport.platform().to_string(), transport);
        self
    }

    pub fn get(&self, platform: &str) -> Result<Arc<dyn PlatformTransport>, TransportError> {
        self.transports
            .get(platform)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPlatform(platform.to_string()))
    }

    pub fn platforms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Resolves credential and transport for outbound calls.
#[derive(Clone)]
pub struct Outbound {
    registry: Arc<AdapterRegistry>,
    credentials: Arc<dyn CredentialStore>,
}

impl Outbound {
    pub fn new(registry: Arc<AdapterRegistry>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Look up the credential for an account.
    pub async fn credential(&self, account_id: &str) -> Result<SecretString, TransportError> {
        self.credentials
            .get_credential(account_id)
            .await
            .ok_or_else(|| TransportError::CredentialMissing {
                account_id: account_id.to_string(),
            })
    }

    pub async fn send_reply(
        &self,
        platform: &str,
        account_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        let transport = self.registry.get(platform)?;
        let credential = self.credential(account_id).await?;
        transport.send_reply(&credential, recipient_id, text).await
    }

    pub async fn post_comment(
        &self,
        platform: &str,
        account_id: &str,
        object_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        let transport = self.registry.get(platform)?;
        let credential = self.credential(account_id).await?;
        transport.post_comment(&credential, object_id, text).await
    }
}
