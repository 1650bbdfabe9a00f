use thiserror::Error;

use crate::session::Audience;

/// Connection and authentication error types
#[derive(Error, Debug)]
pub enum ScAuthError {
    #[error("Failed to load certificate: {0}")]
    CertificateLoad(String),

    #[error("No certificate with thumbprint {thumbprint} was found in the certificate store")]
    CertificateNotFound { thumbprint: String },

    #[error("Certificate {thumbprint} does not have an accessible private key")]
    NoPrivateKey { thumbprint: String },

    #[error("Certificate was rejected by the authentication service: {0}")]
    CertificateRejected(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Missing connection parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Administrator consent required: {}", .0.remediation)]
    ConsentRequired(ConsentGuidance),

    #[error("Device code expired before sign-in was completed")]
    DeviceCodeExpired,

    #[error("Sign-in was declined by the user")]
    AuthorizationDeclined,

    #[error("Authentication was cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No access token available for {audience:?}")]
    NoTokenAvailable { audience: Audience },

    #[error("Access token for {audience:?} lacks required permissions: {missing:?}")]
    InsufficientPermission {
        audience: Audience,
        missing: Vec<String>,
    },

    #[error("No connection available - connect first or pass a connection explicitly")]
    NoConnection,

    #[error("Session registry lock poisoned")]
    LockPoisoned,
}

/// Coarse classification of [`ScAuthError`] used to decide how a caller reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing certificate, missing private key, bad secret or password
    Credential,
    /// The directory requires administrator consent
    ConsentRequired,
    /// Network, TLS, timeout, server-side or malformed-response failures
    Transport,
    /// Caller-initiated cancellation of an interactive flow
    Cancelled,
    /// Problems with an established session (no token, no connection, ...)
    Session,
}

impl ScAuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CertificateLoad(_)
            | Self::CertificateNotFound { .. }
            | Self::NoPrivateKey { .. }
            | Self::CertificateRejected(_)
            | Self::InvalidCredentials(_)
            | Self::MissingParameter(_)
            | Self::DeviceCodeExpired
            | Self::AuthorizationDeclined
            | Self::Io(_) => ErrorKind::Credential,
            Self::ConsentRequired(_) => ErrorKind::ConsentRequired,
            Self::Network(_)
            | Self::Http { .. }
            | Self::InvalidResponse(_)
            | Self::Serde(_)
            | Self::UrlParse(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NoTokenAvailable { .. }
            | Self::InsufficientPermission { .. }
            | Self::NoConnection
            | Self::LockPoisoned => ErrorKind::Session,
        }
    }

    /// Only transport failures may be retried, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UrlParse(_) => false,
            other => other.kind() == ErrorKind::Transport,
        }
    }
}

/// Structured remediation for a consent-required failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentGuidance {
    pub client_id: String,
    /// URL an administrator can open to grant tenant-wide consent
    pub admin_consent_url: String,
    pub remediation: String,
    /// Raw error description returned by the service, if any
    pub service_message: Option<String>,
}

impl ConsentGuidance {
    pub fn for_client(login_base: &str, client_id: &str, service_message: Option<String>) -> Self {
        Self {
            client_id: client_id.to_string(),
            admin_consent_url: format!(
                "{}/common/adminconsent?client_id={}",
                login_base.trim_end_matches('/'),
                client_id
            ),
            remediation: format!(
                "The application {client_id} has not been consented to in this tenant. \
                 Sign in once with the device login and the launch-browser option as an \
                 administrator allowed to grant consent, or have an administrator open the \
                 admin consent URL, then connect again."
            ),
            service_message,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScAuthError>;
