//! Per-session token cache.
//!
//! Each audience has its own async mutex, held for the whole check-then-acquire
//! sequence, so concurrent callers for one audience share a single broker
//! call instead of racing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;
use zeroize::Zeroizing;

use crate::broker::{Flow, TokenBroker};
use crate::certificate::Certificate;
use crate::errors::{Result, ScAuthError};
use crate::session::{Audience, Token};

/// Scopes or roles a caller needs on the token it gets back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionRequirements {
    /// Every one of these must be granted
    pub all_of: Vec<String>,
    /// At least one of these must be granted (ignored when empty)
    pub any_of: Vec<String>,
}

impl PermissionRequirements {
    pub fn all_of<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all_of: scopes.into_iter().map(Into::into).collect(),
            any_of: Vec::new(),
        }
    }

    pub fn any_of<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all_of: Vec::new(),
            any_of: scopes.into_iter().map(Into::into).collect(),
        }
    }

    /// Requirements not satisfied by `granted`
    pub fn missing(&self, granted: &[String]) -> Vec<String> {
        let has = |scope: &str| granted.iter().any(|g| g.eq_ignore_ascii_case(scope));

        let mut missing: Vec<String> = self
            .all_of
            .iter()
            .filter(|scope| !has(scope))
            .cloned()
            .collect();
        if !self.any_of.is_empty() && !self.any_of.iter().any(|scope| has(scope)) {
            missing.push(format!("one of {}", self.any_of.join(", ")));
        }
        missing
    }
}

/// Permission check applied to tokens handed out by the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permissions {
    Required(PermissionRequirements),
    /// Skip both requirement sets
    Bypass,
}

impl Default for Permissions {
    fn default() -> Self {
        Self::Required(PermissionRequirements::default())
    }
}

impl Permissions {
    fn check(&self, token: &Token) -> Result<()> {
        let Self::Required(requirements) = self else {
            return Ok(());
        };
        let Some(granted) = token.granted_scopes() else {
            return Ok(());
        };

        let missing = requirements.missing(granted);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ScAuthError::InsufficientPermission {
                audience: token.audience(),
                missing,
            })
        }
    }
}

/// Credentials a session keeps so it can acquire tokens without the user
pub(crate) enum Reacquire {
    None,
    AppSecret {
        client_id: String,
        client_secret: Zeroizing<String>,
        realm: String,
    },
    AppCertificate {
        client_id: String,
        tenant: String,
        certificate: Arc<Certificate>,
    },
    Password {
        username: String,
        password: Zeroizing<String>,
        client_id: Option<String>,
    },
    RefreshToken {
        client_id: String,
        refresh_token: Zeroizing<String>,
    },
}

impl Reacquire {
    fn flow<'a>(&'a self, target: Option<&'a Url>, audience: Audience) -> Option<Flow<'a>> {
        Some(match self {
            Self::None => return None,
            Self::AppSecret {
                client_id,
                client_secret,
                realm,
            } => Flow::AppSecret {
                target,
                realm,
                client_id,
                client_secret,
                audience,
            },
            Self::AppCertificate {
                client_id,
                tenant,
                certificate,
            } => Flow::AppCertificate {
                target,
                tenant,
                client_id,
                certificate,
                audience,
            },
            Self::Password {
                username,
                password,
                client_id,
            } => Flow::ResourceOwnerPassword {
                target,
                username,
                password,
                client_id: client_id.as_deref(),
                audience,
            },
            Self::RefreshToken {
                client_id,
                refresh_token,
            } => Flow::RefreshToken {
                target,
                client_id,
                refresh_token,
                audience,
            },
        })
    }
}

/// Tokens of one session, at most one per audience
pub(crate) struct TokenCache {
    broker: Option<TokenBroker>,
    reacquire: Mutex<Reacquire>,
    slots: HashMap<Audience, Mutex<Option<Token>>>,
}

impl TokenCache {
    pub(crate) fn new(broker: TokenBroker, reacquire: Reacquire) -> Self {
        Self {
            broker: Some(broker),
            reacquire: Mutex::new(reacquire),
            slots: Audience::ALL
                .into_iter()
                .map(|audience| (audience, Mutex::new(None)))
                .collect(),
        }
    }

    /// A cache that can only serve tokens it is seeded with
    #[cfg(test)]
    pub(crate) fn detached(reacquire: Reacquire) -> Self {
        Self {
            broker: None,
            reacquire: Mutex::new(reacquire),
            slots: Audience::ALL
                .into_iter()
                .map(|audience| (audience, Mutex::new(None)))
                .collect(),
        }
    }

    /// Store the token obtained while connecting
    pub(crate) fn seed(&mut self, token: Token) {
        if let Some(slot) = self.slots.get_mut(&token.audience()) {
            *slot.get_mut() = Some(token);
        }
    }

    fn slot(&self, audience: Audience) -> Result<&Mutex<Option<Token>>> {
        self.slots
            .get(&audience)
            .ok_or(ScAuthError::NoTokenAvailable { audience })
    }

    #[instrument(skip(self, permissions))]
    pub(crate) async fn get_or_acquire(
        &self,
        audience: Audience,
        target: Option<&Url>,
        permissions: &Permissions,
    ) -> Result<Token> {
        let mut cached = self.slot(audience)?.lock().await;

        if let Some(token) = cached.as_ref().filter(|t| t.is_valid()) {
            debug!("Using cached token");
            permissions.check(token)?;
            return Ok(token.clone());
        }

        let token = self.acquire(audience, target).await?;
        *cached = Some(token.clone());
        drop(cached);

        permissions.check(&token)?;
        Ok(token)
    }

    async fn acquire(&self, audience: Audience, target: Option<&Url>) -> Result<Token> {
        let broker = self
            .broker
            .as_ref()
            .ok_or(ScAuthError::NoTokenAvailable { audience })?;
        let mut reacquire = self.reacquire.lock().await;

        let Some(flow) = reacquire.flow(target, audience) else {
            return Err(ScAuthError::NoTokenAvailable { audience });
        };
        debug!("Acquiring new token via {:?}", flow);
        let grant = broker.acquire_token(flow, &CancellationToken::new()).await?;

        if let (Reacquire::RefreshToken { refresh_token, .. }, Some(rotated)) =
            (&mut *reacquire, grant.refresh_token)
        {
            *refresh_token = rotated;
        }
        Ok(grant.token)
    }

    /// Force the cached token's expiry into the past
    pub(crate) async fn invalidate(&self, audience: Audience) {
        if let Ok(slot) = self.slot(audience) {
            if let Some(token) = slot.lock().await.as_mut() {
                token.expire();
            }
        }
    }

    pub(crate) async fn clear(&self) {
        for slot in self.slots.values() {
            slot.lock().await.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthorityOverrides, ConnectConfig};
    use crate::models::fake_jwt;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REALM: &str = "11111111-1111-1111-1111-111111111111";

    fn broker_for(server: &MockServer) -> TokenBroker {
        let mut config = ConnectConfig::default();
        config.authority_overrides = AuthorityOverrides {
            login: Some(server.uri()),
            acs: Some(server.uri()),
        };
        TokenBroker::new(config).unwrap()
    }

    fn app_secret() -> Reacquire {
        Reacquire::AppSecret {
            client_id: "abc".to_string(),
            client_secret: Zeroizing::new("xyz".to_string()),
            realm: REALM.to_string(),
        }
    }

    async fn mount_acs(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path(format!("/{REALM}/tokens/OAuth/2")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "acs-token",
                "expires_in": "3599"
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn target() -> Url {
        Url::parse("https://contoso.sharepoint.com").unwrap()
    }

    #[tokio::test]
    async fn test_second_acquisition_is_served_from_cache() {
        let mock_server = MockServer::start().await;
        mount_acs(&mock_server, 1).await;

        let cache = TokenCache::new(broker_for(&mock_server), app_secret());
        let target = target();
        let first = cache
            .get_or_acquire(Audience::DocumentPlatform, Some(&target), &Permissions::Bypass)
            .await
            .unwrap();
        let second = cache
            .get_or_acquire(Audience::DocumentPlatform, Some(&target), &Permissions::Bypass)
            .await
            .unwrap();

        assert_eq!(first.secret(), second.secret());
    }

    #[tokio::test]
    async fn test_forced_expiry_triggers_exactly_one_more_call() {
        let mock_server = MockServer::start().await;
        mount_acs(&mock_server, 2).await;

        let cache = TokenCache::new(broker_for(&mock_server), app_secret());
        let target = target();
        for _ in 0..2 {
            cache
                .get_or_acquire(Audience::DocumentPlatform, Some(&target), &Permissions::Bypass)
                .await
                .unwrap();
        }

        cache.invalidate(Audience::DocumentPlatform).await;
        let third = cache
            .get_or_acquire(Audience::DocumentPlatform, Some(&target), &Permissions::Bypass)
            .await
            .unwrap();
        assert!(third.is_valid());
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_is_unknown_expiry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{REALM}/tokens/OAuth/2")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "acs-token",
                "expires_in": "100000000000000000"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let cache = TokenCache::new(broker_for(&mock_server), app_secret());
        let token = cache
            .get_or_acquire(Audience::DocumentPlatform, Some(&target()), &Permissions::Bypass)
            .await
            .unwrap();

        assert_eq!(token.secret(), "acs-token");
        assert_eq!(token.expires_at(), None);
        assert!(token.is_valid());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_acquisition() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{REALM}/tokens/OAuth/2")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "access_token": "acs-token", "expires_in": 3599 }))
                    .set_delay(std::time::Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let cache = Arc::new(TokenCache::new(broker_for(&mock_server), app_secret()));
        let target = target();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_acquire(Audience::DocumentPlatform, Some(&target), &Permissions::Bypass)
                    .await
                    .map(|t| t.secret().to_string())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "acs-token");
        }
    }

    #[tokio::test]
    async fn test_no_retained_credentials() {
        let mut cache = TokenCache::detached(Reacquire::None);
        cache.seed(Token::opaque("raw", Audience::DirectoryGraph));

        let token = cache
            .get_or_acquire(Audience::DirectoryGraph, None, &Permissions::default())
            .await
            .unwrap();
        assert_eq!(token.secret(), "raw");

        let err = cache
            .get_or_acquire(Audience::DocumentPlatform, None, &Permissions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScAuthError::NoTokenAvailable { audience: Audience::DocumentPlatform }
        ));

        cache.invalidate(Audience::DirectoryGraph).await;
        assert!(
            cache
                .get_or_acquire(Audience::DirectoryGraph, None, &Permissions::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_permission_requirements() {
        let raw = fake_jwt(json!({ "scp": "Group.Read.All User.Read" }));
        let mut cache = TokenCache::detached(Reacquire::None);
        cache.seed(Token::opaque(raw, Audience::DirectoryGraph));

        let ok = Permissions::Required(PermissionRequirements {
            all_of: vec!["group.read.all".to_string()],
            any_of: vec!["User.ReadWrite.All".to_string(), "User.Read".to_string()],
        });
        assert!(cache.get_or_acquire(Audience::DirectoryGraph, None, &ok).await.is_ok());

        let too_much = Permissions::Required(PermissionRequirements::all_of([
            "Group.ReadWrite.All",
            "User.Read",
        ]));
        match cache.get_or_acquire(Audience::DirectoryGraph, None, &too_much).await {
            Err(ScAuthError::InsufficientPermission { missing, .. }) => {
                assert_eq!(missing, vec!["Group.ReadWrite.All".to_string()]);
            }
            other => panic!("expected InsufficientPermission, got {other:?}"),
        }

        assert!(
            cache
                .get_or_acquire(Audience::DirectoryGraph, None, &Permissions::Bypass)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_refresh_token_rotates() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/organizations/oauth2/v2.0/token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "graph-token",
                "refresh_token": "refresh-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let cache = TokenCache::new(
            broker_for(&mock_server),
            Reacquire::RefreshToken {
                client_id: "abc".to_string(),
                refresh_token: Zeroizing::new("refresh-1".to_string()),
            },
        );
        let token = cache
            .get_or_acquire(Audience::DirectoryGraph, None, &Permissions::Bypass)
            .await
            .unwrap();
        assert_eq!(token.secret(), "graph-token");

        match &*cache.reacquire.lock().await {
            Reacquire::RefreshToken { refresh_token, .. } => {
                assert_eq!(refresh_token.as_str(), "refresh-2");
            }
            _ => panic!("expected refresh token credentials"),
        }
    }
}
