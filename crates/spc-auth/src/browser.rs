use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;
use zeroize::Zeroizing;

use crate::config::wellknown;
use crate::errors::Result;

/// Cookie captured from an interactive login
#[derive(Clone)]
pub struct WebLoginCookie {
    pub name: String,
    pub value: Zeroizing<String>,
}

/// Authenticated transport context produced by an interactive web login
#[derive(Clone, Default)]
pub struct WebLoginContext {
    pub cookies: Vec<WebLoginCookie>,
}

impl WebLoginContext {
    pub fn new(cookies: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            cookies: cookies
                .into_iter()
                .map(|(name, value)| WebLoginCookie {
                    name,
                    value: Zeroizing::new(value),
                })
                .collect(),
        }
    }

    /// Value for a `Cookie` request header
    pub fn cookie_header(&self) -> Zeroizing<String> {
        Zeroizing::new(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value.as_str()))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

impl fmt::Debug for WebLoginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.cookies.iter().map(|c| c.name.as_str()).collect();
        f.debug_struct("WebLoginContext")
            .field("cookies", &names)
            .finish()
    }
}

/// A renderable browser that can drive an interactive login
///
/// Embedders with a UI implement this; headless processes have none and the
/// interactive flow then yields no context.
#[async_trait]
pub trait WebLoginSurface: Send + Sync {
    /// Remove cookies left over from earlier logins
    async fn clear_cookies(&self) -> Result<()>;

    /// Show `login_url` and wait for the user to finish signing in
    ///
    /// Returns `Ok(None)` if the user closed the window without completing.
    async fn login(
        &self,
        login_url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Option<WebLoginContext>>;
}

/// Page the interactive login is pointed at
pub fn web_login_url(target: &Url) -> Result<Url> {
    Ok(target.join(wellknown::WEB_LOGIN_PATH)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_url_is_site_relative_settings_page() {
        let target = Url::parse("https://contoso.sharepoint.com/sites/team").unwrap();
        assert_eq!(
            web_login_url(&target).unwrap().as_str(),
            "https://contoso.sharepoint.com/_layouts/15/settings.aspx"
        );
    }

    #[test]
    fn test_cookie_header_and_debug() {
        let context = WebLoginContext::new([
            ("FedAuth".to_string(), "secret-1".to_string()),
            ("rtFa".to_string(), "secret-2".to_string()),
        ]);
        assert_eq!(context.cookie_header().as_str(), "FedAuth=secret-1; rtFa=secret-2");

        let debug = format!("{context:?}");
        assert!(debug.contains("FedAuth"));
        assert!(!debug.contains("secret-1"));
    }
}
