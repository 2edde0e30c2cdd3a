//! Credential resolution collaborators.
//!
//! Nodes reference credentials only through `{{credential.Name}}`
//! placeholders; resolvers return the secret value and the engine guarantees
//! it is never written to the execution trace in plaintext.

use crate::workflow::storage::WorkflowStorage;
use async_trait::async_trait;
use std::collections::HashMap;

/// Resolves a named credential to its secret value.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Option<String>;
}

/// Environment-variable fallback chain shared by resolvers: `NAME`, then the
/// conventional suffixed forms.
pub(crate) fn env_fallback(name: &str) -> Option<String> {
    for candidate in [
        name.to_string(),
        format!("{name}_API_KEY"),
        format!("{name}_SECRET"),
        format!("{name}_TOKEN"),
    ] {
        if let Ok(value) = std::env::var(&candidate) {
            return Some(value);
        }
    }
    None
}

/// Resolver backed only by process environment variables. Used when no
/// credential store is wired up (local development convenience).
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialResolver;

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, name: &str) -> Option<String> {
        env_fallback(name)
    }
}

/// Resolver backed by the credential table, with env-var fallback so local
/// setups keep working without seeding the store.
#[derive(Debug, Clone)]
pub struct StorageCredentialResolver {
    storage: WorkflowStorage,
}

impl StorageCredentialResolver {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl CredentialResolver for StorageCredentialResolver {
    async fn resolve(&self, name: &str) -> Option<String> {
        match self.storage.get_credential_value(name).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => env_fallback(name),
            Err(e) => {
                tracing::error!("Credential lookup failed for '{}': {}", name, e);
                env_fallback(name)
            }
        }
    }
}

/// Fixed-map resolver for tests and simulation runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialResolver {
    values: HashMap<String, String>,
}

impl StaticCredentialResolver {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_returns_configured_values() {
        let resolver = StaticCredentialResolver::default().with("SlackBotToken", "xoxb-test");
        assert_eq!(
            resolver.resolve("SlackBotToken").await.as_deref(),
            Some("xoxb-test")
        );
        assert_eq!(resolver.resolve("Missing").await, None);
    }

    #[tokio::test]
    async fn env_resolver_checks_suffixed_forms() {
        std::env::set_var("STRANDWAY_TEST_CRED_TOKEN", "tok");
        let resolver = EnvCredentialResolver;
        assert_eq!(
            resolver.resolve("STRANDWAY_TEST_CRED").await.as_deref(),
            Some("tok")
        );
        std::env::remove_var("STRANDWAY_TEST_CRED_TOKEN");
    }
}
