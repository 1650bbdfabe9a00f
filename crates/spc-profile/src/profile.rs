use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use spc_auth::{ConnectConfig, ConnectRequest, Credentials, Environment, PasswordFallback};
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use crate::config::{SecretSource, vars};
use crate::manager::ProfileManagerError;

/// A named way of connecting to a tenant, stored as TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    /// Site URL; left out for graph-only profiles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_admin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_fallback: Option<PasswordFallback>,
    pub auth: AuthMethod,
}

/// Non-secret half of the credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMethod {
    AppSecret {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        realm: Option<String>,
    },
    CertificateFile {
        client_id: String,
        tenant: String,
        path: PathBuf,
    },
    CertificateStore {
        client_id: String,
        tenant: String,
        thumbprint: String,
    },
    CertificatePem {
        client_id: String,
        tenant: String,
        certificate_path: PathBuf,
        private_key_path: PathBuf,
    },
    CertificateBase64 {
        client_id: String,
        tenant: String,
        /// File holding the base64 blob
        blob_path: PathBuf,
    },
    Password {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        redirect_url: Option<String>,
    },
    PasswordOnPrem {
        username: String,
    },
    DeviceCode {
        #[serde(default)]
        launch_browser: bool,
    },
    GraphDeviceCode {
        #[serde(default)]
        launch_browser: bool,
    },
    InteractiveBrowser {
        #[serde(default)]
        clear_cookies: bool,
    },
    AccessToken,
}

impl ConnectionProfile {
    /// Connector configuration for this profile
    pub fn connect_config(&self) -> ConnectConfig {
        let mut config = ConnectConfig::for_environment(self.environment);
        if let Some(fallback) = self.password_fallback {
            config.password_fallback = fallback;
        }
        config
    }

    /// Build a connect request, pulling secrets from `secrets` and reading
    /// any key material the profile points at
    pub async fn to_request(
        &self,
        secrets: &dyn SecretSource,
    ) -> Result<ConnectRequest, ProfileManagerError> {
        debug!("Building connect request for profile '{}'", self.name);

        let credentials = match &self.auth {
            AuthMethod::AppSecret { client_id, realm } => Credentials::AppSecret {
                client_id: client_id.clone(),
                client_secret: required_secret(secrets, vars::CLIENT_SECRET)?,
                realm: realm.clone(),
            },
            AuthMethod::CertificateFile {
                client_id,
                tenant,
                path,
            } => Credentials::CertificateFile {
                client_id: client_id.clone(),
                tenant: tenant.clone(),
                path: path.clone(),
                password: secrets.secret(vars::CERT_PASSWORD),
            },
            AuthMethod::CertificateStore {
                client_id,
                tenant,
                thumbprint,
            } => Credentials::CertificateStore {
                client_id: client_id.clone(),
                tenant: tenant.clone(),
                thumbprint: thumbprint.clone(),
            },
            AuthMethod::CertificatePem {
                client_id,
                tenant,
                certificate_path,
                private_key_path,
            } => Credentials::CertificatePem {
                client_id: client_id.clone(),
                tenant: tenant.clone(),
                certificate_pem: read_credential_file(certificate_path).await?.to_string(),
                private_key_pem: read_credential_file(private_key_path).await?,
                password: secrets.secret(vars::CERT_PASSWORD),
            },
            AuthMethod::CertificateBase64 {
                client_id,
                tenant,
                blob_path,
            } => Credentials::CertificateBase64 {
                client_id: client_id.clone(),
                tenant: tenant.clone(),
                blob: read_credential_file(blob_path).await?,
            },
            AuthMethod::Password {
                username,
                client_id,
                redirect_url,
            } => Credentials::Password {
                username: username.clone(),
                password: required_secret(secrets, vars::PASSWORD)?,
                client_id: client_id.clone(),
                redirect_url: redirect_url.as_deref().map(parse_url).transpose()?,
            },
            AuthMethod::PasswordOnPrem { username } => Credentials::PasswordOnPrem {
                username: username.clone(),
                password: required_secret(secrets, vars::PASSWORD)?,
            },
            AuthMethod::DeviceCode { launch_browser } => Credentials::DeviceCode {
                launch_browser: *launch_browser,
                callback: None,
            },
            AuthMethod::GraphDeviceCode { launch_browser } => Credentials::GraphDeviceCode {
                launch_browser: *launch_browser,
                callback: None,
            },
            AuthMethod::InteractiveBrowser { clear_cookies } => Credentials::InteractiveBrowser {
                clear_cookies: *clear_cookies,
            },
            AuthMethod::AccessToken => Credentials::AccessToken {
                token: required_secret(secrets, vars::ACCESS_TOKEN)?,
            },
        };

        let url = self.url.as_deref().map(parse_url).transpose()?;
        let needs_url = !matches!(
            self.auth,
            AuthMethod::GraphDeviceCode { .. } | AuthMethod::AccessToken
        );
        if needs_url && url.is_none() {
            return Err(ProfileManagerError::MissingUrl {
                profile: self.name.clone(),
            });
        }

        let mut request = match url {
            Some(url) => ConnectRequest::new(url, credentials),
            None => ConnectRequest::graph(credentials),
        };
        if let Some(admin) = self.tenant_admin_url.as_deref() {
            request = request.with_tenant_admin_url(parse_url(admin)?);
        }
        Ok(request)
    }
}

fn required_secret(
    secrets: &dyn SecretSource,
    variable: &'static str,
) -> Result<Zeroizing<String>, ProfileManagerError> {
    secrets
        .secret(variable)
        .ok_or(ProfileManagerError::MissingSecret { variable })
}

fn parse_url(value: &str) -> Result<Url, ProfileManagerError> {
    Url::parse(value).map_err(|e| ProfileManagerError::InvalidUrl {
        value: value.to_string(),
        source: e.into(),
    })
}

async fn read_credential_file(path: &PathBuf) -> Result<Zeroizing<String>, ProfileManagerError> {
    tokio::fs::read_to_string(path)
        .await
        .map(Zeroizing::new)
        .map_err(|e| ProfileManagerError::CredentialFileReadFailed {
            path: path.clone(),
            source: e.into(),
        })
}
