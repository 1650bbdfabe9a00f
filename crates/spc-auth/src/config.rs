use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known identifiers used by the authentication flows
pub mod wellknown {
    /// Public client registered for device-code and password logins
    pub const MANAGEMENT_SHELL_CLIENT_ID: &str = "31359c7f-bd7e-475c-86db-fdb8c937548e";

    /// Principal id of the document platform, used to build ACS resource strings
    pub const DOCUMENT_PLATFORM_PRINCIPAL: &str = "00000003-0000-0ff1-ce00-000000000000";

    /// Unauthenticated probe used for realm discovery
    pub const REALM_PROBE_PATH: &str = "_vti_bin/client.svc";

    /// Page used for interactive browser login, known not to redirect in loops
    pub const WEB_LOGIN_PATH: &str = "/_layouts/15/settings.aspx";

    /// Host marker for pre-production tenants
    pub const PREPRODUCTION_HOST_MARKER: &str = "spoppe.com";

    /// Scopes requested by the directory-graph-only device login
    pub const GRAPH_DEVICE_LOGIN_SCOPES: &[&str] = &[
        "Group.Read.All",
        "openid",
        "email",
        "profile",
        "Group.ReadWrite.All",
        "User.Read.All",
        "Directory.ReadWrite.All",
    ];

    pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
    pub const JWT_BEARER_ASSERTION: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
}

/// Time skew for token expiration (refresh 5 minutes early)
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(300);

/// Lifetime of a signed client assertion
pub const CLIENT_ASSERTION_LIFETIME: Duration = Duration::from_secs(600);

/// Sovereign cloud the tenant lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Environment {
    #[default]
    Production,
    PreProduction,
    China,
    Germany,
    USGovernment,
    USGovernmentHigh,
    USGovernmentDoD,
}

impl Environment {
    pub const ALL: [Environment; 7] = [
        Self::Production,
        Self::PreProduction,
        Self::China,
        Self::Germany,
        Self::USGovernment,
        Self::USGovernmentHigh,
        Self::USGovernmentDoD,
    ];

    /// Host of the Entra ID login service
    pub fn login_host(&self) -> &'static str {
        match self {
            Self::Production | Self::USGovernment => "login.microsoftonline.com",
            Self::PreProduction => "login.windows-ppe.net",
            Self::China => "login.chinacloudapi.cn",
            Self::Germany => "login.microsoftonline.de",
            Self::USGovernmentHigh | Self::USGovernmentDoD => "login.microsoftonline.us",
        }
    }

    /// Host of the legacy ACS token service
    pub fn acs_host(&self) -> &'static str {
        match self {
            Self::Production | Self::USGovernment => "accesscontrol.windows.net",
            Self::PreProduction => "windows-ppe.net",
            Self::China => "accesscontrol.chinacloudapi.cn",
            Self::Germany => "microsoftonline.de",
            Self::USGovernmentHigh | Self::USGovernmentDoD => "microsoftonline.us",
        }
    }

    /// Sub-domain prefix in front of [`Environment::acs_host`]
    pub fn acs_prefix(&self) -> &'static str {
        match self {
            Self::Production | Self::China | Self::USGovernment => "accounts",
            Self::PreProduction
            | Self::Germany
            | Self::USGovernmentHigh
            | Self::USGovernmentDoD => "login",
        }
    }

    /// Top-level domain suffix of tenant sites
    pub fn sharepoint_suffix(&self) -> &'static str {
        match self {
            Self::Production | Self::PreProduction | Self::USGovernment => "com",
            Self::China => "cn",
            Self::Germany => "de",
            Self::USGovernmentHigh | Self::USGovernmentDoD => "us",
        }
    }

    /// Host of the directory graph API
    pub fn graph_host(&self) -> &'static str {
        match self {
            Self::Production | Self::PreProduction | Self::USGovernment => "graph.microsoft.com",
            Self::China => "microsoftgraph.chinacloudapi.cn",
            Self::Germany => "graph.microsoft.de",
            Self::USGovernmentHigh => "graph.microsoft.us",
            Self::USGovernmentDoD => "dod-graph.microsoft.us",
        }
    }

    /// Host fragment identifying a tenant administration site
    pub fn admin_site_marker(&self) -> String {
        match self {
            Self::PreProduction => "-admin.spoppe.com".to_string(),
            other => format!("-admin.sharepoint.{}", other.sharepoint_suffix()),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// What to do when the password grant is rejected by the token service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PasswordFallback {
    /// Attach the username and password to the transport instead of failing
    #[default]
    Automatic,
    /// Surface the rejection to the caller
    Disabled,
}

/// Base URLs that replace the environment defaults, mostly for pointing the
/// flows at a local mock server
#[derive(Debug, Clone, Default)]
pub struct AuthorityOverrides {
    /// Replaces `https://{login_host}`
    pub login: Option<String>,
    /// Replaces `https://{acs_prefix}.{acs_host}`
    pub acs: Option<String>,
}

/// Configuration for the connector and token broker
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub environment: Environment,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    pub password_fallback: PasswordFallback,

    /// Where machine-wide private key material is cached; `None` uses the
    /// platform default
    pub machine_key_dir: Option<PathBuf>,

    pub authority_overrides: AuthorityOverrides,
}

impl ConnectConfig {
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            environment,
            ..Self::default()
        }
    }

    /// Base URL of the Entra ID login service, without trailing slash
    pub fn login_base(&self) -> String {
        match &self.authority_overrides.login {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.environment.login_host()),
        }
    }

    /// Base URL of the ACS service for a target host
    ///
    /// Pre-production tenants always use the pre-production ACS host,
    /// whatever the configured environment.
    pub fn acs_base(&self, target_host: &str) -> String {
        if let Some(base) = &self.authority_overrides.acs {
            return base.trim_end_matches('/').to_string();
        }
        if target_host
            .to_ascii_lowercase()
            .contains(wellknown::PREPRODUCTION_HOST_MARKER)
        {
            let ppe = Environment::PreProduction;
            return format!("https://{}.{}", ppe.acs_prefix(), ppe.acs_host());
        }
        format!(
            "https://{}.{}",
            self.environment.acs_prefix(),
            self.environment.acs_host()
        )
    }

    /// Resolved machine key directory
    pub fn machine_key_dir(&self) -> PathBuf {
        self.machine_key_dir
            .clone()
            .unwrap_or_else(crate::cleanup::default_machine_key_dir)
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("spconnect".to_string()),
            password_fallback: PasswordFallback::default(),
            machine_key_dir: None,
            authority_overrides: AuthorityOverrides::default(),
        }
    }
}
