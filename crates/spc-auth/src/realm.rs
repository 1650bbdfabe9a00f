use reqwest::Client;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use crate::config::wellknown;
use crate::errors::Result;

const BEARER_REALM: &str = "Bearer realm=\"";
const REALM_LEN: usize = 36;

/// Discover the tenant realm by provoking an authentication challenge
///
/// Returns `Ok(None)` when the endpoint does not answer with a usable
/// `Bearer realm="<guid>"` challenge. Network failures are returned as errors.
#[instrument(skip(http))]
pub async fn discover_realm(http: &Client, target: &Url) -> Result<Option<String>> {
    let probe = probe_url(target)?;

    debug!("Probing {} for realm", probe);
    let response = http
        .get(probe)
        .header(AUTHORIZATION, "Bearer ")
        .send()
        .await?;

    if response.status().is_success() {
        debug!("Realm probe succeeded without a challenge");
        return Ok(None);
    }

    let realm = response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(parse_realm);

    debug!("Discovered realm: {:?}", realm);
    Ok(realm)
}

fn probe_url(target: &Url) -> Result<Url> {
    let base = target.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{}/{}", base, wellknown::REALM_PROBE_PATH))?)
}

/// Extract the 36 character realm GUID from a `WWW-Authenticate` header value
pub fn parse_realm(header: &str) -> Option<String> {
    let start = header.find(BEARER_REALM)? + BEARER_REALM.len();
    let candidate = header.get(start..start + REALM_LEN)?;
    Uuid::try_parse(candidate).ok()?;
    Some(candidate.to_string())
}
