#[cfg(test)]
use std::collections::HashMap;

/// Resolves a device's `secret_ref` to the password it authenticates with.
///
/// Storage and encryption of secrets live outside the engine.
pub trait SecretStore: Send + Sync {
    fn secret(&self, reference: &str) -> Option<String>;
}

/// Reads `PROJECTOR_SECRET_<REF>` from the process environment.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn key_for(&self, reference: &str) -> String {
        let suffix: String = reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new("PROJECTOR_SECRET_")
    }
}

impl SecretStore for EnvSecretStore {
    fn secret(&self, reference: &str) -> Option<String> {
        std::env::var(self.key_for(reference)).ok()
    }
}

/// Fixed set of secrets for tests.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

#[cfg(test)]
impl StaticSecretStore {
    pub fn with(mut self, reference: &str, secret: &str) -> Self {
        self.secrets.insert(reference.to_string(), secret.to_string());
        self
    }
}

#[cfg(test)]
impl SecretStore for StaticSecretStore {
    fn secret(&self, reference: &str) -> Option<String> {
        self.secrets.get(reference).cloned()
    }
}
