use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;
use zeroize::Zeroizing;

use crate::browser::WebLoginContext;
use crate::cache::{Permissions, TokenCache};
use crate::certificate::Certificate;
use crate::cleanup::cleanup_machine_key;
use crate::config::{ConnectConfig, Environment, TOKEN_EXPIRY_SKEW};
use crate::errors::{Result, ScAuthError};
use crate::models::AccessTokenClaims;

/// Resource a token is issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Audience {
    /// The tenant's document platform (site) API
    DocumentPlatform,
    /// The directory graph API
    DirectoryGraph,
}

impl Audience {
    pub const ALL: [Audience; 2] = [Self::DocumentPlatform, Self::DirectoryGraph];
}

/// Kind of site a session is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Ordinary,
    TenantAdmin,
}

/// Classify an authenticated endpoint by its host
pub fn classify(endpoint: &Url, environment: Environment) -> Classification {
    let host = endpoint.host_str().unwrap_or_default().to_ascii_lowercase();
    if host.contains(&environment.admin_site_marker()) {
        Classification::TenantAdmin
    } else {
        Classification::Ordinary
    }
}

/// How a session was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    AppSecret,
    DeviceCode,
    CertificateFile,
    CertificateStore,
    CertificatePem,
    CertificateBase64,
    Credentials,
    CredentialsOnPrem,
    InteractiveBrowser,
    RawAccessToken,
    GraphDeviceCode,
}

impl Provenance {
    pub fn is_certificate_based(&self) -> bool {
        matches!(
            self,
            Self::CertificateFile
                | Self::CertificateStore
                | Self::CertificatePem
                | Self::CertificateBase64
        )
    }

    /// Whether the session acts on behalf of a signed-in user
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Self::DeviceCode
                | Self::GraphDeviceCode
                | Self::Credentials
                | Self::CredentialsOnPrem
                | Self::InteractiveBrowser
        )
    }
}

/// An OAuth access token for a single audience
#[derive(Clone)]
pub struct Token {
    access_token: Zeroizing<String>,
    audience: Audience,
    expires_at: Option<DateTime<Utc>>,
    granted_scopes: Option<Vec<String>>,
}

impl Token {
    pub fn new(access_token: impl Into<String>, audience: Audience, expires_in: Option<u64>) -> Self {
        let expires_at = expires_in.and_then(|secs| {
            let at = i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
            if at.is_none() {
                debug!("Token lifetime of {}s is out of range, treating expiry as unknown", secs);
            }
            at
        });
        Self {
            access_token: Zeroizing::new(access_token.into()),
            audience,
            expires_at,
            granted_scopes: None,
        }
    }

    /// Wrap a caller supplied bearer string whose lifetime is unknown
    pub fn opaque(access_token: impl Into<String>, audience: Audience) -> Self {
        let token = Self::new(access_token, audience, None);
        let granted = AccessTokenClaims::peek(token.secret()).map(|c| c.granted());
        token.with_granted_scopes(granted.filter(|g| !g.is_empty()))
    }

    pub fn with_granted_scopes(mut self, granted_scopes: Option<Vec<String>>) -> Self {
        self.granted_scopes = granted_scopes;
        self
    }

    /// The raw bearer value
    pub fn secret(&self) -> &str {
        &self.access_token
    }

    pub fn audience(&self) -> Audience {
        self.audience
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Scopes and roles granted to the token, when known
    pub fn granted_scopes(&self) -> Option<&[String]> {
        self.granted_scopes.as_deref()
    }

    /// A token is valid until five minutes before it expires; unknown expiry
    /// is always valid
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let skew = chrono::Duration::from_std(TOKEN_EXPIRY_SKEW)
            .unwrap_or(chrono::Duration::seconds(300));
        match self.expires_at {
            Some(expires_at) => now + skew < expires_at,
            None => true,
        }
    }

    /// Move the expiry into the past so the token is never served again
    pub(crate) fn expire(&mut self) {
        self.expires_at = Some(Utc::now() - chrono::Duration::days(1));
    }

    /// `Bearer <token>` header value
    pub fn bearer(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("Bearer {}", self.secret()))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("audience", &self.audience)
            .field("expires_at", &self.expires_at)
            .field("granted_scopes", &self.granted_scopes)
            .finish()
    }
}

/// Credentials attached to outgoing requests instead of a bearer token
#[derive(Clone, Default)]
pub enum TransportCredentials {
    #[default]
    None,
    /// Username and password sent with every request
    Basic {
        username: String,
        password: Zeroizing<String>,
    },
    /// Cookies captured by an interactive web login
    WebLogin(WebLoginContext),
}

impl fmt::Debug for TransportCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::WebLogin(context) => f.debug_tuple("WebLogin").field(context).finish(),
        }
    }
}

/// Everything needed to construct a [`Session`]
pub(crate) struct SessionParts {
    pub endpoint: Option<Url>,
    pub provenance: Provenance,
    pub tenant_id: Option<String>,
    pub certificate: Option<Arc<Certificate>>,
    pub scopes: Vec<String>,
    pub delete_certificate_on_teardown: bool,
    pub client_id: Option<String>,
    pub transport: TransportCredentials,
    pub tenant_admin_url: Option<Url>,
    pub cache: TokenCache,
}

/// An authenticated connection to a tenant
pub struct Session {
    endpoint: Option<Url>,
    classification: Classification,
    provenance: Provenance,
    tenant_id: Option<String>,
    certificate: Option<Arc<Certificate>>,
    scopes: Vec<String>,
    environment: Environment,
    delete_certificate_on_teardown: bool,
    client_id: Option<String>,
    transport: TransportCredentials,
    tenant_admin_url: Option<Url>,
    created_at: DateTime<Utc>,
    machine_key_dir: PathBuf,
    http_timeouts: crate::config::HttpTimeouts,
    user_agent: Option<String>,
    cache: TokenCache,
}

impl Session {
    pub(crate) fn new(parts: SessionParts, config: &ConnectConfig) -> Result<Self> {
        if parts.certificate.is_some() != parts.provenance.is_certificate_based() {
            return Err(ScAuthError::MissingParameter("certificate"));
        }

        let classification = parts
            .endpoint
            .as_ref()
            .map(|endpoint| classify(endpoint, config.environment))
            .unwrap_or(Classification::Ordinary);

        Ok(Self {
            endpoint: parts.endpoint,
            classification,
            provenance: parts.provenance,
            tenant_id: parts.tenant_id.filter(|t| !t.is_empty()),
            certificate: parts.certificate,
            scopes: parts.scopes,
            environment: config.environment,
            delete_certificate_on_teardown: parts.delete_certificate_on_teardown,
            client_id: parts.client_id,
            transport: parts.transport,
            tenant_admin_url: parts.tenant_admin_url,
            created_at: Utc::now(),
            machine_key_dir: config.machine_key_dir(),
            http_timeouts: config.http_timeouts.clone(),
            user_agent: config.user_agent.clone(),
            cache: parts.cache,
        })
    }

    /// Endpoint the session authenticated against; `None` for graph-only sessions
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn is_tenant_admin(&self) -> bool {
        self.classification == Classification::TenantAdmin
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn certificate(&self) -> Option<&Arc<Certificate>> {
        self.certificate.as_ref()
    }

    /// Scopes fixed at creation time
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn delete_certificate_on_teardown(&self) -> bool {
        self.delete_certificate_on_teardown
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn transport(&self) -> &TransportCredentials {
        &self.transport
    }

    /// Tenant administration URL supplied by the caller, if any
    pub fn tenant_admin_url(&self) -> Option<&Url> {
        self.tenant_admin_url.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get a valid access token for `audience`, acquiring one if needed
    pub async fn get_token(&self, audience: Audience, permissions: &Permissions) -> Result<Token> {
        self.cache
            .get_or_acquire(audience, self.endpoint.as_ref(), permissions)
            .await
    }

    /// `Authorization` header value for `audience`
    pub async fn bearer_header(
        &self,
        audience: Audience,
        permissions: &Permissions,
    ) -> Result<Zeroizing<String>> {
        Ok(self.get_token(audience, permissions).await?.bearer())
    }

    /// Force the next [`Session::get_token`] for `audience` to acquire a new token
    pub async fn invalidate(&self, audience: Audience) {
        self.cache.invalidate(audience).await;
    }

    /// Attach this session's credentials to an outgoing request
    ///
    /// Sessions that fell back to transport credentials send those instead of
    /// a bearer token.
    pub async fn authorize_request(
        &self,
        request: RequestBuilder,
        audience: Audience,
        permissions: &Permissions,
    ) -> Result<RequestBuilder> {
        match &self.transport {
            TransportCredentials::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password.as_str())))
            }
            TransportCredentials::WebLogin(context) if audience == Audience::DocumentPlatform => {
                Ok(request.header(COOKIE, context.cookie_header().as_str()))
            }
            _ => {
                let bearer = self.bearer_header(audience, permissions).await?;
                Ok(request.header(AUTHORIZATION, bearer.as_str()))
            }
        }
    }

    /// HTTP client for calls made with this session, presenting the session
    /// certificate for client authentication when there is one
    pub fn http_client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.http_timeouts.connect)
            .timeout(self.http_timeouts.request)
            .user_agent(self.user_agent.as_deref().unwrap_or("spconnect"));

        if let Some(certificate) = &self.certificate {
            let (cert_pem, key_pem) = certificate.identity_pem()?;
            let identity = reqwest::Identity::from_pkcs8_pem(&cert_pem, &key_pem)?;
            builder = builder.identity(identity);
        }

        Ok(builder.build()?)
    }

    /// Drop cached tokens and clean up certificate material loaded from a file
    #[instrument(skip(self), fields(provenance = ?self.provenance))]
    pub async fn teardown(&self) {
        self.cache.clear().await;

        if !self.delete_certificate_on_teardown {
            return;
        }
        if let Some(certificate) = &self.certificate {
            debug!("Cleaning up key material for {}", certificate.thumbprint());
            cleanup_machine_key(certificate, &self.machine_key_dir).await;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint.as_ref().map(Url::as_str))
            .field("classification", &self.classification)
            .field("provenance", &self.provenance)
            .field("tenant_id", &self.tenant_id)
            .field("certificate", &self.certificate.as_ref().map(|c| c.thumbprint()))
            .field("environment", &self.environment)
            .field("client_id", &self.client_id)
            .field("transport", &self.transport)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Reacquire;
    use crate::certificate::fixtures::*;
    use crate::certificate::resolve_from_pem;

    fn session(provenance: Provenance, certificate: Option<Arc<Certificate>>) -> Result<Session> {
        let config = ConnectConfig::default();
        let parts = SessionParts {
            endpoint: Some(Url::parse("https://contoso-admin.sharepoint.com").unwrap()),
            provenance,
            tenant_id: Some(String::new()),
            certificate,
            scopes: Vec::new(),
            delete_certificate_on_teardown: false,
            client_id: None,
            transport: TransportCredentials::None,
            tenant_admin_url: None,
            cache: TokenCache::detached(Reacquire::None),
        };
        Session::new(parts, &config)
    }

    #[test]
    fn test_classification_for_every_environment() {
        for env in Environment::ALL {
            let suffix = env.sharepoint_suffix();
            let (admin, ordinary) = if env == Environment::PreProduction {
                ("https://contoso-admin.spoppe.com".to_string(), "https://contoso.spoppe.com".to_string())
            } else {
                (
                    format!("https://Contoso-Admin.SharePoint.{suffix}/"),
                    format!("https://contoso.sharepoint.{suffix}/sites/admin"),
                )
            };
            assert_eq!(
                classify(&Url::parse(&admin).unwrap(), env),
                Classification::TenantAdmin,
                "{env:?}"
            );
            assert_eq!(
                classify(&Url::parse(&ordinary).unwrap(), env),
                Classification::Ordinary,
                "{env:?}"
            );
        }
    }

    #[test]
    fn test_token_validity_margin() {
        let token = Token::new("abc", Audience::DocumentPlatform, Some(3600));
        assert!(token.is_valid());

        let expires_at = token.expires_at().unwrap();
        assert!(token.is_valid_at(expires_at - chrono::Duration::minutes(6)));
        assert!(!token.is_valid_at(expires_at - chrono::Duration::minutes(4)));

        let short = Token::new("abc", Audience::DocumentPlatform, Some(120));
        assert!(!short.is_valid());
    }

    #[test]
    fn test_out_of_range_lifetime_has_unknown_expiry() {
        for secs in [u64::MAX, i64::MAX as u64, 100_000_000_000_000_000] {
            let token = Token::new("abc", Audience::DocumentPlatform, Some(secs));
            assert_eq!(token.expires_at(), None, "{secs}");
        }
    }

    #[test]
    fn test_unknown_expiry_is_always_valid() {
        let token = Token::opaque("opaque", Audience::DirectoryGraph);
        assert!(token.is_valid_at(Utc::now() + chrono::Duration::days(3650)));
        assert_eq!(token.granted_scopes(), None);
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = Token::new("super-secret-token", Audience::DirectoryGraph, None);
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret-token"));
        assert_eq!(token.bearer().as_str(), "Bearer super-secret-token");
    }

    #[test]
    fn test_certificate_presence_matches_provenance() {
        let cert = Arc::new(resolve_from_pem(CERT_PEM, KEY_PEM, None).unwrap());

        assert!(session(Provenance::CertificatePem, Some(cert.clone())).is_ok());
        assert!(session(Provenance::CertificatePem, None).is_err());
        assert!(session(Provenance::AppSecret, Some(cert)).is_err());
    }

    #[test]
    fn test_session_classifies_and_drops_empty_tenant() {
        let session = session(Provenance::AppSecret, None).unwrap();
        assert!(session.is_tenant_admin());
        assert_eq!(session.tenant_id(), None);
    }

    #[tokio::test]
    async fn test_basic_transport_credentials_are_attached() {
        let mut parts_session = session(Provenance::Credentials, None).unwrap();
        parts_session.transport = TransportCredentials::Basic {
            username: "alice@contoso.com".to_string(),
            password: Zeroizing::new("pa55".to_string()),
        };

        let request = parts_session
            .authorize_request(
                Client::new().get("https://contoso.sharepoint.com/_api/web"),
                Audience::DocumentPlatform,
                &Permissions::Bypass,
            )
            .await
            .unwrap()
            .build()
            .unwrap();

        let header = request.headers().get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(header.starts_with("Basic "));
        assert!(!format!("{:?}", parts_session.transport()).contains("pa55"));
    }

    #[test]
    fn test_certificate_session_builds_http_client() {
        let cert = Arc::new(resolve_from_pem(CERT_PEM, KEY_PEM, None).unwrap());
        let with_cert = session(Provenance::CertificatePem, Some(cert.clone())).unwrap();
        assert!(with_cert.http_client().is_ok());

        cert.release_private_key();
        assert!(matches!(
            with_cert.http_client(),
            Err(ScAuthError::NoPrivateKey { .. })
        ));

        let plain = session(Provenance::AppSecret, None).unwrap();
        assert!(plain.http_client().is_ok());
    }

    #[tokio::test]
    async fn test_teardown_cleans_file_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert = Arc::new(resolve_from_pem(CERT_PEM, KEY_PEM, None).unwrap());
        let cached = dir.path().join(cert.key_container_name().unwrap());
        std::fs::write(&cached, b"key").unwrap();

        let mut config = ConnectConfig::default();
        config.machine_key_dir = Some(dir.path().to_path_buf());
        let parts = SessionParts {
            endpoint: Some(Url::parse("https://contoso.sharepoint.com").unwrap()),
            provenance: Provenance::CertificateFile,
            tenant_id: None,
            certificate: Some(cert.clone()),
            scopes: Vec::new(),
            delete_certificate_on_teardown: true,
            client_id: Some("abc".to_string()),
            transport: TransportCredentials::None,
            tenant_admin_url: None,
            cache: TokenCache::detached(Reacquire::None),
        };
        let session = Session::new(parts, &config).unwrap();

        session.teardown().await;

        assert!(!cached.exists());
        assert!(!cert.has_private_key());
    }
}
