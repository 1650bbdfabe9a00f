use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::{TokenBroker, TokenGrant, grant_from_aad};
use crate::config::wellknown;
use crate::errors::{ConsentGuidance, Result, ScAuthError};
use crate::models::{AadErrorResponse, AadTokenResponse, DeviceCodeResponse};
use crate::session::Audience;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CODE_LIFETIME: Duration = Duration::from_secs(900);
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// What the user needs to complete a device login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodePrompt {
    pub user_code: String,
    pub verification_uri: String,
    /// Ready-made instruction text from the service
    pub message: String,
    pub expires_in: Duration,
}

/// Called once the device code is issued, to show it to the user
pub type DeviceCodeCallback = Arc<dyn Fn(&DeviceCodePrompt) + Send + Sync>;

impl TokenBroker {
    /// Device authorization grant with the management-shell public client
    ///
    /// Polls until the user signs in, the code expires, or `cancel` fires.
    #[instrument(skip(self, callback, cancel))]
    pub(crate) async fn device_code(
        &self,
        scopes: &[String],
        audience: Audience,
        launch_browser: bool,
        callback: Option<&DeviceCodeCallback>,
        cancel: &CancellationToken,
    ) -> Result<TokenGrant> {
        let client_id = wellknown::MANAGEMENT_SHELL_CLIENT_ID;
        let scope = scopes.join(" ");

        debug!("Requesting device code");
        let request = self
            .http()
            .post(self.device_code_url())
            .form(&[("client_id", client_id), ("scope", scope.as_str())])
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ScAuthError::Cancelled),
            response = request => response?,
        };
        let device: DeviceCodeResponse = self.read_token_response(response, client_id).await?;

        let lifetime = device
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CODE_LIFETIME);
        let deadline = Instant::now().checked_add(lifetime).ok_or_else(|| {
            ScAuthError::InvalidResponse(format!(
                "device code lifetime of {}s is out of range",
                lifetime.as_secs()
            ))
        })?;

        let prompt = DeviceCodePrompt {
            user_code: device.user_code.clone(),
            verification_uri: device.verification_uri.clone(),
            message: device.message.clone().unwrap_or_else(|| {
                format!(
                    "To sign in, use a web browser to open the page {} and enter the code {} to authenticate.",
                    device.verification_uri, device.user_code
                )
            }),
            expires_in: lifetime,
        };
        match callback {
            Some(callback) => callback(&prompt),
            None => info!("{}", prompt.message),
        }
        if launch_browser {
            if let Err(e) = webbrowser::open(&prompt.verification_uri) {
                warn!("Failed to launch browser: {}", e);
            }
        }

        let interval = device
            .interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        self.poll_device_code(&device.device_code, interval, deadline, audience, cancel)
            .await
    }

    async fn poll_device_code(
        &self,
        device_code: &str,
        mut interval: Duration,
        deadline: Instant,
        audience: Audience,
        cancel: &CancellationToken,
    ) -> Result<TokenGrant> {
        let client_id = wellknown::MANAGEMENT_SHELL_CLIENT_ID;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Device code polling cancelled");
                    return Err(ScAuthError::Cancelled);
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if Instant::now() >= deadline {
                return Err(ScAuthError::DeviceCodeExpired);
            }

            let request = self
                .http()
                .post(self.delegated_token_url())
                .form(&[
                    ("grant_type", wellknown::DEVICE_CODE_GRANT),
                    ("client_id", client_id),
                    ("device_code", device_code),
                ])
                .send();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(ScAuthError::Cancelled),
                response = request => response?,
            };

            let status = response.status();
            if status.is_success() {
                let body: AadTokenResponse = response.json().await?;
                debug!("Device login completed");
                return Ok(grant_from_aad(body, audience));
            }

            let body = response.text().await.unwrap_or_default();
            let Ok(error) = serde_json::from_str::<AadErrorResponse>(&body) else {
                return Err(self.classify_failure(status, &body, client_id));
            };

            match error.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => {
                    interval = interval.saturating_add(SLOW_DOWN_INCREMENT);
                    debug!("Service asked to slow down, polling every {:?}", interval);
                }
                "expired_token" | "code_expired" => return Err(ScAuthError::DeviceCodeExpired),
                "authorization_declined" | "access_denied" => {
                    return Err(ScAuthError::AuthorizationDeclined);
                }
                _ if error.is_consent_required() => {
                    return Err(ScAuthError::ConsentRequired(ConsentGuidance::for_client(
                        &self.config().login_base(),
                        client_id,
                        error.error_description.clone(),
                    )));
                }
                _ => return Err(self.classify_failure(status, &body, client_id)),
            }
        }
    }
}
