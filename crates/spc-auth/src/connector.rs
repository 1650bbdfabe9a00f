//! Establishing sessions from caller credentials.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::broker::{Acquired, Flow, TokenBroker, TokenGrant};
use crate::browser::WebLoginSurface;
use crate::cache::{Reacquire, TokenCache};
use crate::certificate::{
    Certificate, CertificateStore, DirectoryCertificateStore, resolve_from_base64,
    resolve_from_file, resolve_from_pem, resolve_from_store,
};
use crate::config::{ConnectConfig, PasswordFallback, wellknown};
use crate::device::DeviceCodeCallback;
use crate::errors::{Result, ScAuthError};
use crate::realm::discover_realm;
use crate::registry::{Registration, SessionRegistry};
use crate::session::{Audience, Provenance, Session, SessionParts, TransportCredentials};

/// Credential input for [`Connector::connect`]
pub enum Credentials {
    AppSecret {
        client_id: String,
        client_secret: Zeroizing<String>,
        /// Discovered from the target when `None`
        realm: Option<String>,
    },
    CertificateFile {
        client_id: String,
        tenant: String,
        path: PathBuf,
        password: Option<Zeroizing<String>>,
    },
    CertificateStore {
        client_id: String,
        tenant: String,
        thumbprint: String,
    },
    CertificatePem {
        client_id: String,
        tenant: String,
        certificate_pem: String,
        private_key_pem: Zeroizing<String>,
        password: Option<Zeroizing<String>>,
    },
    CertificateBase64 {
        client_id: String,
        tenant: String,
        blob: Zeroizing<String>,
    },
    Password {
        username: String,
        password: Zeroizing<String>,
        client_id: Option<String>,
        redirect_url: Option<Url>,
    },
    /// Username and password sent directly to an on-premises farm
    PasswordOnPrem {
        username: String,
        password: Zeroizing<String>,
    },
    DeviceCode {
        launch_browser: bool,
        callback: Option<DeviceCodeCallback>,
    },
    /// Device login for the directory graph only, with a fixed scope set
    GraphDeviceCode {
        launch_browser: bool,
        callback: Option<DeviceCodeCallback>,
    },
    InteractiveBrowser { clear_cookies: bool },
    AccessToken { token: Zeroizing<String> },
}

impl Credentials {
    fn name(&self) -> &'static str {
        match self {
            Self::AppSecret { .. } => "AppSecret",
            Self::CertificateFile { .. } => "CertificateFile",
            Self::CertificateStore { .. } => "CertificateStore",
            Self::CertificatePem { .. } => "CertificatePem",
            Self::CertificateBase64 { .. } => "CertificateBase64",
            Self::Password { .. } => "Password",
            Self::PasswordOnPrem { .. } => "PasswordOnPrem",
            Self::DeviceCode { .. } => "DeviceCode",
            Self::GraphDeviceCode { .. } => "GraphDeviceCode",
            Self::InteractiveBrowser { .. } => "InteractiveBrowser",
            Self::AccessToken { .. } => "AccessToken",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to connect to and how
#[derive(Debug)]
pub struct ConnectRequest {
    /// Site to connect to; `None` only for graph-only logins
    pub url: Option<Url>,
    pub credentials: Credentials,
    /// Tenant administration URL carried on the session for later use
    pub tenant_admin_url: Option<Url>,
}

impl ConnectRequest {
    pub fn new(url: Url, credentials: Credentials) -> Self {
        Self {
            url: Some(url),
            credentials,
            tenant_admin_url: None,
        }
    }

    /// A request without a site, for the directory graph only
    pub fn graph(credentials: Credentials) -> Self {
        Self {
            url: None,
            credentials,
            tenant_admin_url: None,
        }
    }

    pub fn with_tenant_admin_url(mut self, url: Url) -> Self {
        self.tenant_admin_url = Some(url);
        self
    }
}

/// Builds sessions and registers them
pub struct Connector {
    broker: TokenBroker,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn CertificateStore>,
    surface: Option<Arc<dyn WebLoginSurface>>,
}

impl Connector {
    pub fn new(config: ConnectConfig, registry: Arc<SessionRegistry>) -> Result<Self> {
        let store: Arc<dyn CertificateStore> = Arc::new(DirectoryCertificateStore::default_location()?);
        Ok(Self {
            broker: TokenBroker::new(config)?,
            registry,
            store,
            surface: None,
        })
    }

    pub fn with_certificate_store(mut self, store: Arc<dyn CertificateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_web_login_surface(mut self, surface: Arc<dyn WebLoginSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn config(&self) -> &ConnectConfig {
        self.broker.config()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Establish a session; see [`Connector::connect_with_cancel`]
    pub async fn connect(&self, request: ConnectRequest, registration: Registration) -> Result<Option<Arc<Session>>> {
        self.connect_with_cancel(request, registration, &CancellationToken::new())
            .await
    }

    /// Establish a session and register it
    ///
    /// Returns `Ok(None)` only for an interactive browser login that could
    /// not be shown or was not completed.
    #[instrument(skip(self, cancel), fields(url = request.url.as_ref().map(Url::as_str)))]
    pub async fn connect_with_cancel(
        &self,
        request: ConnectRequest,
        registration: Registration,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Session>>> {
        let ConnectRequest {
            url,
            credentials,
            tenant_admin_url,
        } = request;

        let Some(mut parts) = self.build(url, credentials, cancel).await? else {
            return Ok(None);
        };
        parts.tenant_admin_url = tenant_admin_url;

        let session = Arc::new(Session::new(parts, self.config())?);
        info!(
            provenance = ?session.provenance(),
            classification = ?session.classification(),
            "Connected"
        );
        self.registry.register(session, registration).map(Some)
    }

    async fn build(
        &self,
        url: Option<Url>,
        credentials: Credentials,
        cancel: &CancellationToken,
    ) -> Result<Option<SessionParts>> {
        let parts = match credentials {
            Credentials::AppSecret {
                client_id,
                client_secret,
                realm,
            } => {
                let url = require_url(url)?;
                self.connect_app_secret(url, client_id, client_secret, realm, cancel)
                    .await?
            }
            Credentials::CertificateFile {
                client_id,
                tenant,
                path,
                password,
            } => {
                let url = require_url(url)?;
                let certificate = resolve_from_file(&path, password.as_deref().map(String::as_str)).await?;
                let mut parts = self
                    .connect_certificate(url, client_id, tenant, certificate, Provenance::CertificateFile, cancel)
                    .await?;
                parts.delete_certificate_on_teardown = true;
                parts
            }
            Credentials::CertificateStore {
                client_id,
                tenant,
                thumbprint,
            } => {
                let url = require_url(url)?;
                let certificate = resolve_from_store(self.store.as_ref(), &thumbprint).await?;
                self.connect_certificate(url, client_id, tenant, certificate, Provenance::CertificateStore, cancel)
                    .await?
            }
            Credentials::CertificatePem {
                client_id,
                tenant,
                certificate_pem,
                private_key_pem,
                password,
            } => {
                let url = require_url(url)?;
                let certificate = resolve_from_pem(
                    &certificate_pem,
                    &private_key_pem,
                    password.as_deref().map(String::as_str),
                )?;
                self.connect_certificate(url, client_id, tenant, certificate, Provenance::CertificatePem, cancel)
                    .await?
            }
            Credentials::CertificateBase64 {
                client_id,
                tenant,
                blob,
            } => {
                let url = require_url(url)?;
                let certificate = resolve_from_base64(&blob)?;
                self.connect_certificate(url, client_id, tenant, certificate, Provenance::CertificateBase64, cancel)
                    .await?
            }
            Credentials::Password {
                username,
                password,
                client_id,
                redirect_url,
            } => {
                let url = require_url(url)?;
                if let Some(redirect_url) = &redirect_url {
                    debug!("Redirect URL {} is not used by the password grant", redirect_url);
                }
                self.connect_password(url, username, password, client_id, cancel)
                    .await?
            }
            Credentials::PasswordOnPrem { username, password } => {
                let url = require_url(url)?;
                self.parts(
                    Some(url),
                    Provenance::CredentialsOnPrem,
                    TokenCache::new(self.broker.clone(), Reacquire::None),
                )
                .with_transport(TransportCredentials::Basic { username, password })
            }
            Credentials::DeviceCode {
                launch_browser,
                callback,
            } => {
                let url = require_url(url)?;
                let scopes = split_scopes(&self.broker.delegated_scope(Audience::DocumentPlatform, Some(&url))?);
                self.connect_device_code(
                    Some(url),
                    scopes,
                    Audience::DocumentPlatform,
                    Provenance::DeviceCode,
                    launch_browser,
                    callback,
                    cancel,
                )
                .await?
            }
            Credentials::GraphDeviceCode {
                launch_browser,
                callback,
            } => {
                let scopes = self.broker.graph_device_scopes();
                self.connect_device_code(
                    None,
                    scopes,
                    Audience::DirectoryGraph,
                    Provenance::GraphDeviceCode,
                    launch_browser,
                    callback,
                    cancel,
                )
                .await?
            }
            Credentials::InteractiveBrowser { clear_cookies } => {
                let url = require_url(url)?;
                let flow = Flow::InteractiveBrowser {
                    target: &url,
                    clear_cookies,
                    surface: self.surface.as_deref(),
                };
                let Acquired::WebLogin(Some(context)) = self.broker.acquire(flow, cancel).await?
                else {
                    debug!("Interactive login produced no context");
                    return Ok(None);
                };
                self.parts(
                    Some(url),
                    Provenance::InteractiveBrowser,
                    TokenCache::new(self.broker.clone(), Reacquire::None),
                )
                .with_transport(TransportCredentials::WebLogin(context))
            }
            Credentials::AccessToken { token } => {
                let audience = if url.is_some() {
                    Audience::DocumentPlatform
                } else {
                    Audience::DirectoryGraph
                };
                let grant = self
                    .broker
                    .acquire_token(Flow::DirectAccessToken { token: &token, audience }, cancel)
                    .await?;
                let mut parts = self.parts(
                    url,
                    Provenance::RawAccessToken,
                    TokenCache::new(self.broker.clone(), Reacquire::None),
                );
                parts.tenant_id = grant.tenant_id.clone();
                parts.cache.seed(grant.token);
                parts
            }
        };

        Ok(Some(parts))
    }

    async fn connect_app_secret(
        &self,
        url: Url,
        client_id: String,
        client_secret: Zeroizing<String>,
        realm: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<SessionParts> {
        let realm = match realm.filter(|r| !r.is_empty()) {
            Some(realm) => realm,
            None => discover_realm(self.broker.http(), &url)
                .await?
                .ok_or(ScAuthError::MissingParameter("realm"))?,
        };

        let grant = self
            .broker
            .acquire_token(
                Flow::AppSecret {
                    target: Some(&url),
                    realm: &realm,
                    client_id: &client_id,
                    client_secret: &client_secret,
                    audience: Audience::DocumentPlatform,
                },
                cancel,
            )
            .await?;

        let reacquire = Reacquire::AppSecret {
            client_id: client_id.clone(),
            client_secret,
            realm: realm.clone(),
        };
        let resource = self.broker.acs_resource(&url, &realm)?;
        let mut parts = self.parts(
            Some(url),
            Provenance::AppSecret,
            TokenCache::new(self.broker.clone(), reacquire),
        );
        parts.scopes = vec![resource];
        parts.tenant_id = Some(realm);
        parts.client_id = Some(client_id);
        parts.cache.seed(grant.token);
        Ok(parts)
    }

    async fn connect_certificate(
        &self,
        url: Url,
        client_id: String,
        tenant: String,
        certificate: Certificate,
        provenance: Provenance,
        cancel: &CancellationToken,
    ) -> Result<SessionParts> {
        let certificate = Arc::new(certificate);
        let grant = self
            .broker
            .acquire_token(
                Flow::AppCertificate {
                    target: Some(&url),
                    tenant: &tenant,
                    client_id: &client_id,
                    certificate: &certificate,
                    audience: Audience::DocumentPlatform,
                },
                cancel,
            )
            .await?;

        let reacquire = Reacquire::AppCertificate {
            client_id: client_id.clone(),
            tenant: tenant.clone(),
            certificate: certificate.clone(),
        };
        let scope = self.broker.default_scope(Audience::DocumentPlatform, Some(&url))?;
        let mut parts = self.parts(
            Some(url),
            provenance,
            TokenCache::new(self.broker.clone(), reacquire),
        );
        parts.scopes = vec![scope];
        parts.certificate = Some(certificate);
        parts.tenant_id = Some(tenant);
        parts.client_id = Some(client_id);
        parts.cache.seed(grant.token);
        Ok(parts)
    }

    async fn connect_password(
        &self,
        url: Url,
        username: String,
        password: Zeroizing<String>,
        client_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<SessionParts> {
        let result = self
            .broker
            .acquire_token(
                Flow::ResourceOwnerPassword {
                    target: Some(&url),
                    username: &username,
                    password: &password,
                    client_id: client_id.as_deref(),
                    audience: Audience::DocumentPlatform,
                },
                cancel,
            )
            .await;

        let grant = match result {
            Ok(grant) => grant,
            Err(e @ (ScAuthError::InvalidCredentials(_) | ScAuthError::Http { .. }))
                if self.config().password_fallback == PasswordFallback::Automatic =>
            {
                warn!("Password grant rejected ({}), sending credentials with each request instead", e);
                return Ok(self
                    .parts(
                        Some(url),
                        Provenance::Credentials,
                        TokenCache::new(self.broker.clone(), Reacquire::None),
                    )
                    .with_transport(TransportCredentials::Basic { username, password }));
            }
            Err(e) => return Err(e),
        };

        let TokenGrant {
            token,
            refresh_token,
            tenant_id,
        } = grant;
        let client_id = client_id.unwrap_or_else(|| wellknown::MANAGEMENT_SHELL_CLIENT_ID.to_string());
        let reacquire = match refresh_token {
            Some(refresh_token) => Reacquire::RefreshToken {
                client_id: client_id.clone(),
                refresh_token,
            },
            None => Reacquire::Password {
                username,
                password,
                client_id: Some(client_id.clone()),
            },
        };

        let scopes = split_scopes(&self.broker.delegated_scope(Audience::DocumentPlatform, Some(&url))?);
        let mut parts = self.parts(
            Some(url),
            Provenance::Credentials,
            TokenCache::new(self.broker.clone(), reacquire),
        );
        parts.scopes = scopes;
        parts.tenant_id = tenant_id;
        parts.client_id = Some(client_id);
        parts.cache.seed(token);
        Ok(parts)
    }

    #[allow(clippy::too_many_arguments)]
    async fn connect_device_code(
        &self,
        url: Option<Url>,
        scopes: Vec<String>,
        audience: Audience,
        provenance: Provenance,
        launch_browser: bool,
        callback: Option<DeviceCodeCallback>,
        cancel: &CancellationToken,
    ) -> Result<SessionParts> {
        let grant = self
            .broker
            .acquire_token(
                Flow::DeviceCode {
                    scopes: scopes.clone(),
                    audience,
                    launch_browser,
                    callback: callback.as_ref(),
                },
                cancel,
            )
            .await?;

        let client_id = wellknown::MANAGEMENT_SHELL_CLIENT_ID.to_string();
        let reacquire = match grant.refresh_token {
            Some(refresh_token) => Reacquire::RefreshToken {
                client_id: client_id.clone(),
                refresh_token,
            },
            None => Reacquire::None,
        };

        let mut parts = self.parts(url, provenance, TokenCache::new(self.broker.clone(), reacquire));
        parts.scopes = scopes;
        parts.tenant_id = grant.tenant_id;
        parts.client_id = Some(client_id);
        parts.cache.seed(grant.token);
        Ok(parts)
    }

    fn parts(&self, endpoint: Option<Url>, provenance: Provenance, cache: TokenCache) -> SessionParts {
        SessionParts {
            endpoint,
            provenance,
            tenant_id: None,
            certificate: None,
            scopes: Vec::new(),
            delete_certificate_on_teardown: false,
            client_id: None,
            transport: TransportCredentials::None,
            tenant_admin_url: None,
            cache,
        }
    }
}

impl SessionParts {
    fn with_transport(mut self, transport: TransportCredentials) -> Self {
        self.transport = transport;
        self
    }
}

fn require_url(url: Option<Url>) -> Result<Url> {
    url.ok_or(ScAuthError::MissingParameter("url"))
}

fn split_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}
