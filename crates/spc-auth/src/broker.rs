//! Token acquisition, one handler per [`Flow`].

use std::fmt;

use chrono::Utc;
use jsonwebtoken::{Algorithm, Header};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::browser::{WebLoginContext, WebLoginSurface, web_login_url};
use crate::certificate::Certificate;
use crate::config::{CLIENT_ASSERTION_LIFETIME, ConnectConfig, wellknown};
use crate::device::DeviceCodeCallback;
use crate::errors::{ConsentGuidance, Result, ScAuthError};
use crate::models::{
    AadErrorResponse, AadTokenResponse, AccessTokenClaims, AcsTokenResponse,
    ClientAssertionClaims, split_scopes,
};
use crate::session::{Audience, Token};

/// Authority used by delegated (user) flows
const ORGANIZATIONS: &str = "organizations";

/// One way of obtaining a token
pub enum Flow<'a> {
    /// Shared secret exchanged against ACS, or against Entra ID for the graph
    AppSecret {
        target: Option<&'a Url>,
        realm: &'a str,
        client_id: &'a str,
        client_secret: &'a str,
        audience: Audience,
    },
    /// App-only token using a certificate-signed client assertion
    AppCertificate {
        target: Option<&'a Url>,
        tenant: &'a str,
        client_id: &'a str,
        certificate: &'a Certificate,
        audience: Audience,
    },
    ResourceOwnerPassword {
        target: Option<&'a Url>,
        username: &'a str,
        password: &'a str,
        client_id: Option<&'a str>,
        audience: Audience,
    },
    DeviceCode {
        scopes: Vec<String>,
        audience: Audience,
        launch_browser: bool,
        callback: Option<&'a DeviceCodeCallback>,
    },
    InteractiveBrowser {
        target: &'a Url,
        clear_cookies: bool,
        surface: Option<&'a dyn WebLoginSurface>,
    },
    /// Caller supplied bearer string
    DirectAccessToken { token: &'a str, audience: Audience },
    /// Exchange a refresh token from an earlier delegated login
    RefreshToken {
        target: Option<&'a Url>,
        client_id: &'a str,
        refresh_token: &'a str,
        audience: Audience,
    },
}

impl Flow<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::AppSecret { .. } => "AppSecret",
            Self::AppCertificate { .. } => "AppCertificate",
            Self::ResourceOwnerPassword { .. } => "ResourceOwnerPassword",
            Self::DeviceCode { .. } => "DeviceCode",
            Self::InteractiveBrowser { .. } => "InteractiveBrowser",
            Self::DirectAccessToken { .. } => "DirectAccessToken",
            Self::RefreshToken { .. } => "RefreshToken",
        }
    }
}

impl fmt::Debug for Flow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A token together with what a delegated login may additionally return
#[derive(Clone)]
pub struct TokenGrant {
    pub token: Token,
    pub refresh_token: Option<Zeroizing<String>>,
    /// `tid` claim of the access token, when it is a readable JWT
    pub tenant_id: Option<String>,
}

impl TokenGrant {
    fn from_token(token: Token) -> Self {
        let tenant_id = AccessTokenClaims::peek(token.secret()).and_then(|c| c.tid);
        Self {
            token,
            refresh_token: None,
            tenant_id,
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token", &self.token)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Result of a successful acquisition
#[derive(Debug)]
pub enum Acquired {
    Token(TokenGrant),
    /// Interactive web login; `None` when no browser surface is available or
    /// the user did not complete the login
    WebLogin(Option<WebLoginContext>),
}

/// Talks to the token services of one environment
#[derive(Debug, Clone)]
pub struct TokenBroker {
    config: ConnectConfig,
    http: Client,
}

impl TokenBroker {
    pub fn new(config: ConnectConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("spconnect"))
            .build()?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Acquire a token (or web login context) through `flow`
    ///
    /// Transport failures are returned as-is; retrying is up to the caller.
    #[instrument(skip(self, cancel))]
    pub async fn acquire(&self, flow: Flow<'_>, cancel: &CancellationToken) -> Result<Acquired> {
        if cancel.is_cancelled() {
            return Err(ScAuthError::Cancelled);
        }

        let grant = match flow {
            Flow::AppSecret {
                target,
                realm,
                client_id,
                client_secret,
                audience,
            } => match audience {
                Audience::DocumentPlatform => {
                    let target = target.ok_or(ScAuthError::MissingParameter("url"))?;
                    self.acs_client_credentials(target, realm, client_id, client_secret)
                        .await?
                }
                Audience::DirectoryGraph => {
                    self.aad_secret_client_credentials(realm, client_id, client_secret)
                        .await?
                }
            },
            Flow::AppCertificate {
                target,
                tenant,
                client_id,
                certificate,
                audience,
            } => {
                let scope = self.default_scope(audience, target)?;
                self.aad_certificate_client_credentials(tenant, client_id, certificate, &scope, audience)
                    .await?
            }
            Flow::ResourceOwnerPassword {
                target,
                username,
                password,
                client_id,
                audience,
            } => {
                let scope = self.delegated_scope(audience, target)?;
                let client_id = client_id.unwrap_or(wellknown::MANAGEMENT_SHELL_CLIENT_ID);
                self.password_grant(username, password, client_id, &scope, audience)
                    .await?
            }
            Flow::DeviceCode {
                scopes,
                audience,
                launch_browser,
                callback,
            } => {
                self.device_code(&scopes, audience, launch_browser, callback, cancel)
                    .await?
            }
            Flow::InteractiveBrowser {
                target,
                clear_cookies,
                surface,
            } => {
                return Ok(Acquired::WebLogin(
                    self.web_login(target, clear_cookies, surface, cancel).await?,
                ));
            }
            Flow::DirectAccessToken { token, audience } => {
                if token.trim().is_empty() {
                    return Err(ScAuthError::InvalidCredentials(
                        "Access token is empty".to_string(),
                    ));
                }
                TokenGrant::from_token(Token::opaque(token.trim(), audience))
            }
            Flow::RefreshToken {
                target,
                client_id,
                refresh_token,
                audience,
            } => {
                let scope = self.delegated_scope(audience, target)?;
                self.refresh_grant(client_id, refresh_token, &scope, audience)
                    .await?
            }
        };

        Ok(Acquired::Token(grant))
    }

    /// Like [`TokenBroker::acquire`] for flows that always yield a token
    pub async fn acquire_token(&self, flow: Flow<'_>, cancel: &CancellationToken) -> Result<TokenGrant> {
        match self.acquire(flow, cancel).await? {
            Acquired::Token(grant) => Ok(grant),
            Acquired::WebLogin(_) => Err(ScAuthError::InvalidResponse(
                "Interactive login does not produce an access token".to_string(),
            )),
        }
    }

    /// `.default` scope of the resource behind `audience`
    pub fn default_scope(&self, audience: Audience, target: Option<&Url>) -> Result<String> {
        match audience {
            Audience::DocumentPlatform => {
                let target = target.ok_or(ScAuthError::MissingParameter("url"))?;
                Ok(format!("{}/.default", target.origin().ascii_serialization()))
            }
            Audience::DirectoryGraph => Ok(format!(
                "https://{}/.default",
                self.config.environment.graph_host()
            )),
        }
    }

    /// Scope string for a user flow, asking for a refresh token as well
    pub fn delegated_scope(&self, audience: Audience, target: Option<&Url>) -> Result<String> {
        Ok(format!("{} offline_access", self.default_scope(audience, target)?))
    }

    /// Fully qualified graph scopes for the graph-only device login
    pub fn graph_device_scopes(&self) -> Vec<String> {
        const OIDC: &[&str] = &["openid", "email", "profile", "offline_access"];
        let graph = self.config.environment.graph_host();
        wellknown::GRAPH_DEVICE_LOGIN_SCOPES
            .iter()
            .map(|scope| {
                if OIDC.contains(scope) {
                    scope.to_string()
                } else {
                    format!("https://{graph}/{scope}")
                }
            })
            .chain(std::iter::once("offline_access".to_string()))
            .collect()
    }

    /// ACS `resource` value for the document platform behind `target`
    pub fn acs_resource(&self, target: &Url, realm: &str) -> Result<String> {
        let host = target_authority(target)?;
        Ok(format!("{}/{}@{}", wellknown::DOCUMENT_PLATFORM_PRINCIPAL, host, realm))
    }

    pub(crate) fn token_url(&self, tenant: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.config.login_base(), tenant)
    }

    pub(crate) fn delegated_token_url(&self) -> String {
        self.token_url(ORGANIZATIONS)
    }

    pub(crate) fn device_code_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/devicecode",
            self.config.login_base(),
            ORGANIZATIONS
        )
    }

    #[instrument(skip(self, client_secret))]
    async fn acs_client_credentials(
        &self,
        target: &Url,
        realm: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenGrant> {
        if realm.is_empty() {
            return Err(ScAuthError::MissingParameter("realm"));
        }
        let host = target_authority(target)?;
        let url = format!("{}/{}/tokens/OAuth/2", self.config.acs_base(&host), realm);
        let client_id = format!("{client_id}@{realm}");
        let resource = self.acs_resource(target, realm)?;

        debug!("Requesting app-only token from ACS at {}", url);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret),
                ("resource", resource.as_str()),
            ])
            .send()
            .await?;

        let body: AcsTokenResponse = self.read_token_response(response, &client_id).await?;
        let token = Token::new(body.access_token, Audience::DocumentPlatform, body.expires_in);
        Ok(TokenGrant::from_token(token_with_claims(token)))
    }

    #[instrument(skip(self, client_secret))]
    async fn aad_secret_client_credentials(
        &self,
        tenant: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenGrant> {
        if tenant.is_empty() {
            return Err(ScAuthError::MissingParameter("realm"));
        }
        let scope = self.default_scope(Audience::DirectoryGraph, None)?;

        debug!("Requesting app-only graph token with client secret");
        let response = self
            .http
            .post(self.token_url(tenant))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;

        self.aad_grant(response, client_id, Audience::DirectoryGraph)
            .await
    }

    #[instrument(skip(self, certificate), fields(thumbprint = certificate.thumbprint()))]
    async fn aad_certificate_client_credentials(
        &self,
        tenant: &str,
        client_id: &str,
        certificate: &Certificate,
        scope: &str,
        audience: Audience,
    ) -> Result<TokenGrant> {
        if tenant.is_empty() {
            return Err(ScAuthError::MissingParameter("tenant"));
        }
        let url = self.token_url(tenant);
        let assertion = client_assertion(&url, client_id, certificate)?;

        debug!("Requesting app-only token with certificate assertion");
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_assertion_type", wellknown::JWT_BEARER_ASSERTION),
                ("client_assertion", assertion.as_str()),
                ("scope", scope),
            ])
            .send()
            .await?;

        self.aad_grant(response, client_id, audience).await
    }

    #[instrument(skip(self, password))]
    async fn password_grant(
        &self,
        username: &str,
        password: &str,
        client_id: &str,
        scope: &str,
        audience: Audience,
    ) -> Result<TokenGrant> {
        debug!("Requesting delegated token with username and password");
        let response = self
            .http
            .post(self.delegated_token_url())
            .form(&[
                ("grant_type", "password"),
                ("client_id", client_id),
                ("username", username),
                ("password", password),
                ("scope", scope),
            ])
            .send()
            .await?;

        self.aad_grant(response, client_id, audience).await
    }

    #[instrument(skip(self, refresh_token))]
    async fn refresh_grant(
        &self,
        client_id: &str,
        refresh_token: &str,
        scope: &str,
        audience: Audience,
    ) -> Result<TokenGrant> {
        debug!("Redeeming refresh token");
        let response = self
            .http
            .post(self.delegated_token_url())
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("refresh_token", refresh_token),
                ("scope", scope),
            ])
            .send()
            .await?;

        self.aad_grant(response, client_id, audience).await
    }

    async fn web_login(
        &self,
        target: &Url,
        clear_cookies: bool,
        surface: Option<&dyn WebLoginSurface>,
        cancel: &CancellationToken,
    ) -> Result<Option<WebLoginContext>> {
        let Some(surface) = surface else {
            warn!("Interactive login requested but no browser surface is available");
            return Ok(None);
        };

        if clear_cookies {
            debug!("Clearing cookies before interactive login");
            surface.clear_cookies().await?;
        }

        let login_url = web_login_url(target)?;
        debug!("Starting interactive login at {}", login_url);
        tokio::select! {
            _ = cancel.cancelled() => Err(ScAuthError::Cancelled),
            context = surface.login(&login_url, cancel) => context,
        }
    }

    pub(crate) async fn aad_grant(
        &self,
        response: Response,
        client_id: &str,
        audience: Audience,
    ) -> Result<TokenGrant> {
        let body: AadTokenResponse = self.read_token_response(response, client_id).await?;
        Ok(grant_from_aad(body, audience))
    }

    /// Decode a successful token response or classify the failure
    pub(crate) async fn read_token_response<T: DeserializeOwned>(
        &self,
        response: Response,
        client_id: &str,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(self.classify_failure(status, &body, client_id))
    }

    pub(crate) fn classify_failure(
        &self,
        status: reqwest::StatusCode,
        body: &str,
        client_id: &str,
    ) -> ScAuthError {
        let http_error = || ScAuthError::Http {
            status,
            body_snippet: body.chars().take(200).collect(),
        };

        let rejected = || {
            ScAuthError::InvalidCredentials(format!(
                "Token service rejected the request with {status}"
            ))
        };
        let is_auth_status = matches!(
            status,
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        );

        if status.is_server_error() {
            return http_error();
        }
        let Ok(error) = serde_json::from_str::<AadErrorResponse>(body) else {
            return if is_auth_status { rejected() } else { http_error() };
        };

        if error.is_consent_required() {
            return ScAuthError::ConsentRequired(ConsentGuidance::for_client(
                &self.config.login_base(),
                client_id,
                error.error_description.clone(),
            ));
        }
        if error.is_certificate_rejected() {
            return ScAuthError::CertificateRejected(error.description());
        }
        match error.error.as_str() {
            "invalid_grant" | "invalid_client" | "unauthorized_client" | "invalid_request"
            | "invalid_scope" | "interaction_required" => {
                ScAuthError::InvalidCredentials(error.description())
            }
            _ if is_auth_status => ScAuthError::InvalidCredentials(error.description()),
            _ => http_error(),
        }
    }
}

/// Host (and non-default port) of a target URL
fn target_authority(target: &Url) -> Result<String> {
    let host = target
        .host_str()
        .ok_or(ScAuthError::MissingParameter("url host"))?;
    Ok(match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn token_with_claims(token: Token) -> Token {
    let granted = AccessTokenClaims::peek(token.secret())
        .map(|c| c.granted())
        .filter(|g| !g.is_empty());
    token.with_granted_scopes(granted)
}

pub(crate) fn grant_from_aad(body: AadTokenResponse, audience: Audience) -> TokenGrant {
    let token = Token::new(body.access_token, audience, body.expires_in);
    let token = match body.scope.as_deref().map(split_scopes) {
        Some(scopes) if !scopes.is_empty() => token.with_granted_scopes(Some(scopes)),
        _ => token_with_claims(token),
    };

    let mut grant = TokenGrant::from_token(token);
    grant.refresh_token = body.refresh_token.map(Zeroizing::new);
    grant
}

/// Signed RS256 client assertion for `token_url`
fn client_assertion(token_url: &str, client_id: &str, certificate: &Certificate) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = ClientAssertionClaims {
        aud: token_url.to_string(),
        exp: now + CLIENT_ASSERTION_LIFETIME.as_secs() as i64,
        iat: now,
        iss: client_id.to_string(),
        jti: Uuid::new_v4().to_string(),
        nbf: now,
        sub: client_id.to_string(),
    };

    let mut header = Header::new(Algorithm::RS256);
    header.x5t = Some(certificate.x5t().to_string());

    jsonwebtoken::encode(&header, &claims, &certificate.signing_key()?)
        .map_err(|e| ScAuthError::CertificateLoad(format!("Failed to sign client assertion: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::fixtures::*;
    use crate::certificate::resolve_from_pem;
    use crate::config::AuthorityOverrides;
    use crate::errors::ErrorKind;
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

    fn target() -> Url {
        Url::parse("https://contoso.sharepoint.com/sites/team").unwrap()
    }

    #[tokio::test]
    async fn test_app_secret_uses_acs_resource_format() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{REALM}/tokens/OAuth/2")))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains(format!("client_id=abc%40{REALM}").as_str()))
            .and(body_string_contains(
                format!("resource=00000003-0000-0ff1-ce00-000000000000%2Fcontoso.sharepoint.com%40{REALM}")
                    .as_str(),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "access_token": "acs-token",
                "expires_in": "3599"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let target = target();
        let grant = broker
            .acquire_token(
                Flow::AppSecret {
                    target: Some(&target),
                    realm: REALM,
                    client_id: "abc",
                    client_secret: "xyz",
                    audience: Audience::DocumentPlatform,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(grant.token.secret(), "acs-token");
        assert_eq!(grant.token.audience(), Audience::DocumentPlatform);
        assert!(grant.token.is_valid());
    }

    #[tokio::test]
    async fn test_app_secret_invalid_client_is_credential_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{REALM}/tokens/OAuth/2")))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided."
            })))
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let target = target();
        let err = broker
            .acquire(
                Flow::AppSecret {
                    target: Some(&target),
                    realm: REALM,
                    client_id: "abc",
                    client_secret: "wrong",
                    audience: Audience::DocumentPlatform,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Credential);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_transport_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/organizations/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let target = target();
        let err = broker
            .acquire(
                Flow::ResourceOwnerPassword {
                    target: Some(&target),
                    username: "alice@contoso.com",
                    password: "pa55",
                    client_id: None,
                    audience: Audience::DocumentPlatform,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ScAuthError::Http { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_html_unauthorized_is_not_retryable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/organizations/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string("<html><body>Access denied</body></html>"),
            )
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let target = target();
        let err = broker
            .acquire(
                Flow::ResourceOwnerPassword {
                    target: Some(&target),
                    username: "alice@contoso.com",
                    password: "pa55",
                    client_id: None,
                    audience: Audience::DocumentPlatform,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ScAuthError::InvalidCredentials(_)));
        assert!(!err.is_retryable());

        let teapot = broker.classify_failure(reqwest::StatusCode::IM_A_TEAPOT, "<html/>", "abc");
        assert!(matches!(teapot, ScAuthError::Http { .. }));
    }

    #[tokio::test]
    async fn test_password_grant_reads_scopes_and_tenant() {
        let access_token = fake_jwt(json!({
            "tid": "22222222-2222-2222-2222-222222222222",
            "scp": "AllSites.FullControl"
        }));
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/organizations/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains(
                format!("client_id={}", wellknown::MANAGEMENT_SHELL_CLIENT_ID).as_str(),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": access_token,
                "refresh_token": "refresh-1",
                "expires_in": 3600,
                "scope": "https://contoso.sharepoint.com/AllSites.FullControl https://contoso.sharepoint.com/.default"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let target = target();
        let grant = broker
            .acquire_token(
                Flow::ResourceOwnerPassword {
                    target: Some(&target),
                    username: "alice@contoso.com",
                    password: "pa55",
                    client_id: None,
                    audience: Audience::DocumentPlatform,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            grant.tenant_id.as_deref(),
            Some("22222222-2222-2222-2222-222222222222")
        );
        assert_eq!(grant.refresh_token.as_deref().map(String::as_str), Some("refresh-1"));
        assert_eq!(
            grant.token.granted_scopes().unwrap(),
            &["AllSites.FullControl".to_string(), ".default".to_string()]
        );
    }

    #[tokio::test]
    async fn test_certificate_flow_sends_signed_assertion() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso.onmicrosoft.com/oauth2/v2.0/token"))
            .and(body_string_contains("client_assertion_type=urn%3Aietf%3Aparams%3Aoauth%3Aclient-assertion-type%3Ajwt-bearer"))
            .and(body_string_contains("client_assertion=ey"))
            .and(body_string_contains("scope=https%3A%2F%2Fcontoso.sharepoint.com%2F.default"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "cert-token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let certificate = resolve_from_pem(CERT_PEM, KEY_PEM, None).unwrap();
        let target = target();
        let grant = broker
            .acquire_token(
                Flow::AppCertificate {
                    target: Some(&target),
                    tenant: "contoso.onmicrosoft.com",
                    client_id: "abc",
                    certificate: &certificate,
                    audience: Audience::DocumentPlatform,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(grant.token.secret(), "cert-token");
    }

    #[test]
    fn test_client_assertion_header_carries_x5t() {
        let certificate = resolve_from_pem(CERT_PEM, KEY_PEM, None).unwrap();
        let assertion = client_assertion(
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token",
            "abc",
            &certificate,
        )
        .unwrap();

        let header = jsonwebtoken::decode_header(&assertion).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.x5t.as_deref(), Some(certificate.x5t()));
    }

    #[tokio::test]
    async fn test_rejected_certificate_is_classified() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "AADSTS700027: Client assertion contains an invalid signature.",
                "error_codes": [700027]
            })))
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let certificate = resolve_from_pem(CERT_PEM, KEY_PEM, None).unwrap();
        let err = broker
            .acquire(
                Flow::AppCertificate {
                    target: None,
                    tenant: "contoso",
                    client_id: "abc",
                    certificate: &certificate,
                    audience: Audience::DirectoryGraph,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ScAuthError::CertificateRejected(_)));
    }

    #[tokio::test]
    async fn test_consent_required_carries_guidance() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/organizations/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS65001: The user or administrator has not consented to use the application.",
                "error_codes": [65001]
            })))
            .mount(&mock_server)
            .await;

        let broker = broker_for(&mock_server);
        let target = target();
        let err = broker
            .acquire(
                Flow::ResourceOwnerPassword {
                    target: Some(&target),
                    username: "alice@contoso.com",
                    password: "pa55",
                    client_id: Some("custom-app"),
                    audience: Audience::DocumentPlatform,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            ScAuthError::ConsentRequired(guidance) => {
                assert_eq!(guidance.client_id, "custom-app");
                assert!(guidance.admin_consent_url.starts_with(&mock_server.uri()));
                assert!(guidance.service_message.unwrap().contains("AADSTS65001"));
            }
            other => panic!("expected ConsentRequired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_direct_access_token() {
        let broker = TokenBroker::new(ConnectConfig::default()).unwrap();
        let raw = fake_jwt(json!({ "tid": "tenant-1", "roles": ["Group.Read.All"] }));

        let grant = broker
            .acquire_token(
                Flow::DirectAccessToken {
                    token: &raw,
                    audience: Audience::DirectoryGraph,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(grant.token.expires_at(), None);
        assert_eq!(grant.tenant_id.as_deref(), Some("tenant-1"));

        let err = broker
            .acquire(
                Flow::DirectAccessToken {
                    token: "  ",
                    audience: Audience::DirectoryGraph,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Credential);
    }

    #[tokio::test]
    async fn test_interactive_login_without_surface_is_none() {
        let broker = TokenBroker::new(ConnectConfig::default()).unwrap();
        let target = target();
        let acquired = broker
            .acquire(
                Flow::InteractiveBrowser {
                    target: &target,
                    clear_cookies: true,
                    surface: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(acquired, Acquired::WebLogin(None)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let broker = TokenBroker::new(ConnectConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = broker
            .acquire(
                Flow::DirectAccessToken {
                    token: "abc",
                    audience: Audience::DirectoryGraph,
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScAuthError::Cancelled));
    }

    #[test]
    fn test_graph_device_scopes_are_qualified() {
        let broker = TokenBroker::new(ConnectConfig::default()).unwrap();
        let scopes = broker.graph_device_scopes();
        assert!(scopes.contains(&"https://graph.microsoft.com/Group.Read.All".to_string()));
        assert!(scopes.contains(&"openid".to_string()));
        assert!(scopes.contains(&"offline_access".to_string()));
    }

    #[test]
    fn test_default_scope_keeps_port() {
        let broker = TokenBroker::new(ConnectConfig::default()).unwrap();
        let target = Url::parse("http://127.0.0.1:8080/sites/team").unwrap();
        assert_eq!(
            broker
                .default_scope(Audience::DocumentPlatform, Some(&target))
                .unwrap(),
            "http://127.0.0.1:8080/.default"
        );
        assert!(broker.default_scope(Audience::DocumentPlatform, None).is_err());
    }
}
