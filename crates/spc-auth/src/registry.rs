use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::errors::{Result, ScAuthError};
use crate::session::Session;

/// Whether a newly established session replaces the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Registration {
    #[default]
    MakeCurrent,
    /// Hand the session back to the caller only
    Detached,
}

/// Holds the "current" session of a process
///
/// Create one at start-up, share it as `Arc<SessionRegistry>`, and call
/// [`SessionRegistry::clear`] before exiting. Tests create their own.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    current: RwLock<Option<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session according to `registration`, returning it
    pub fn register(&self, session: Arc<Session>, registration: Registration) -> Result<Arc<Session>> {
        match registration {
            Registration::MakeCurrent => {
                let previous = self
                    .current
                    .write()
                    .map_err(|_| ScAuthError::LockPoisoned)?
                    .replace(session.clone());
                info!(
                    provenance = ?session.provenance(),
                    classification = ?session.classification(),
                    replaced = previous.is_some(),
                    "Registered current session"
                );
            }
            Registration::Detached => debug!("Returning detached session"),
        }
        Ok(session)
    }

    pub fn current(&self) -> Result<Option<Arc<Session>>> {
        Ok(self
            .current
            .read()
            .map_err(|_| ScAuthError::LockPoisoned)?
            .clone())
    }

    /// The explicitly passed session, or else the current one
    pub fn resolve(&self, explicit: Option<&Arc<Session>>) -> Result<Arc<Session>> {
        if let Some(session) = explicit {
            return Ok(session.clone());
        }
        self.current()?.ok_or(ScAuthError::NoConnection)
    }

    /// Remove the current session and tear it down
    ///
    /// Returns `false` when there was no current session.
    pub async fn disconnect(&self) -> Result<bool> {
        let previous = self
            .current
            .write()
            .map_err(|_| ScAuthError::LockPoisoned)?
            .take();

        match previous {
            Some(session) => {
                session.teardown().await;
                info!("Disconnected current session");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the current session at process end
    pub async fn clear(&self) -> Result<()> {
        self.disconnect().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Reacquire, TokenCache};
    use crate::config::ConnectConfig;
    use crate::session::{Provenance, SessionParts, TransportCredentials};
    use url::Url;

    fn session(url: &str) -> Arc<Session> {
        let parts = SessionParts {
            endpoint: Some(Url::parse(url).unwrap()),
            provenance: Provenance::RawAccessToken,
            tenant_id: None,
            certificate: None,
            scopes: Vec::new(),
            delete_certificate_on_teardown: false,
            client_id: None,
            transport: TransportCredentials::None,
            tenant_admin_url: None,
            cache: TokenCache::detached(Reacquire::None),
        };
        Arc::new(Session::new(parts, &ConnectConfig::default()).unwrap())
    }

    #[test]
    fn test_make_current_replaces() {
        let registry = SessionRegistry::new();
        let first = registry
            .register(session("https://contoso.sharepoint.com"), Registration::MakeCurrent)
            .unwrap();
        let second = registry
            .register(session("https://fabrikam.sharepoint.com"), Registration::MakeCurrent)
            .unwrap();

        let current = registry.current().unwrap().unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert!(!Arc::ptr_eq(&current, &first));
    }

    #[test]
    fn test_detached_leaves_current_alone() {
        let registry = SessionRegistry::new();
        let current = registry
            .register(session("https://contoso.sharepoint.com"), Registration::MakeCurrent)
            .unwrap();
        let detached = registry
            .register(session("https://fabrikam.sharepoint.com"), Registration::Detached)
            .unwrap();

        assert!(Arc::ptr_eq(&registry.current().unwrap().unwrap(), &current));
        assert!(Arc::ptr_eq(&registry.resolve(Some(&detached)).unwrap(), &detached));
        assert!(Arc::ptr_eq(&registry.resolve(None).unwrap(), &current));
    }

    #[tokio::test]
    async fn test_resolve_without_connection() {
        let registry = SessionRegistry::new();
        assert!(matches!(registry.resolve(None), Err(ScAuthError::NoConnection)));

        registry
            .register(session("https://contoso.sharepoint.com"), Registration::MakeCurrent)
            .unwrap();
        assert!(registry.disconnect().await.unwrap());
        assert!(!registry.disconnect().await.unwrap());
        assert!(matches!(registry.resolve(None), Err(ScAuthError::NoConnection)));
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = SessionRegistry::new();
        let b = SessionRegistry::new();
        a.register(session("https://contoso.sharepoint.com"), Registration::MakeCurrent)
            .unwrap();
        assert!(b.current().unwrap().is_none());
    }
}
