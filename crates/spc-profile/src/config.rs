use std::collections::HashMap;

use zeroize::Zeroizing;

/// Environment variables secrets are read from; profiles never store them
pub mod vars {
    pub const CLIENT_SECRET: &str = "SPCONNECT_CLIENT_SECRET";
    pub const PASSWORD: &str = "SPCONNECT_PASSWORD";
    pub const CERT_PASSWORD: &str = "SPCONNECT_CERT_PASSWORD";
    pub const ACCESS_TOKEN: &str = "SPCONNECT_ACCESS_TOKEN";
}

/// Where profile secrets come from
pub trait SecretSource: Send + Sync {
    fn secret(&self, name: &str) -> Option<Zeroizing<String>>;
}

/// Reads secrets from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn secret(&self, name: &str) -> Option<Zeroizing<String>> {
        std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Zeroizing::new)
    }
}

/// Fixed secrets, for tests
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl SecretSource for StaticSecrets {
    fn secret(&self, name: &str) -> Option<Zeroizing<String>> {
        self.values.get(name).cloned().map(Zeroizing::new)
    }
}
