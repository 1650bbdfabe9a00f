use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Deserializer, Serialize};

/// Token response from the legacy ACS endpoint
///
/// ACS reports `expires_in` as a string, so both shapes are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct AcsTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub resource: Option<String>,
}

/// Token response from the Entra ID v2 endpoint (all grants)
#[derive(Debug, Clone, Deserialize)]
pub struct AadTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Error body returned by Entra ID and ACS token endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AadErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_codes: Vec<u64>,
}

impl AadErrorResponse {
    /// AADSTS65001: the user or administrator has not consented
    pub fn is_consent_required(&self) -> bool {
        self.error == "consent_required"
            || self.error_codes.contains(&65001)
            || self
                .error_description
                .as_deref()
                .is_some_and(|d| d.contains("AADSTS65001"))
    }

    /// AADSTS700027 and friends: the client assertion could not be validated
    pub fn is_certificate_rejected(&self) -> bool {
        const CERTIFICATE_CODES: &[u64] = &[700027, 700023, 700024, 50012];
        self.error == "invalid_client"
            && self.error_codes.iter().any(|c| CERTIFICATE_CODES.contains(c))
    }

    pub fn description(&self) -> String {
        self.error_description
            .clone()
            .unwrap_or_else(|| self.error.clone())
    }
}

/// Device authorization response
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Claims of a signed client assertion
#[derive(Debug, Clone, Serialize)]
pub struct ClientAssertionClaims {
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub jti: String,
    pub nbf: i64,
    pub sub: String,
}

/// The subset of access token claims the core cares about
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessTokenClaims {
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub scp: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl AccessTokenClaims {
    /// Read the payload of a JWT without validating its signature
    ///
    /// Returns `None` for opaque tokens.
    pub fn peek(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Delegated scopes and application roles as short names
    pub fn granted(&self) -> Vec<String> {
        let mut granted: Vec<String> = self
            .scp
            .as_deref()
            .map(split_scopes)
            .unwrap_or_default();
        granted.extend(self.roles.iter().cloned());
        granted
    }
}

/// Split a space separated scope string, dropping resource prefixes
/// (`https://host/AllSites.Read` becomes `AllSites.Read`)
pub fn split_scopes(scopes: &str) -> Vec<String> {
    scopes
        .split_whitespace()
        .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
pub(crate) fn fake_jwt(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}
