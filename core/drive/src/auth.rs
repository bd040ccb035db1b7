//! OAuth2 token lifecycle for Microsoft Graph.
//!
//! [`TokenManager`] owns the access token. Concurrent callers that find the
//! token missing or about to expire all await one shared refresh; a failed
//! refresh is reported to every waiter and is not remembered, so the next
//! call starts a new one.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use oauth2::basic::{BasicErrorResponse, BasicTokenResponse};
use oauth2::{TokenResponse, TokenUrl};
use reqwest::Method;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use graphfs_common::{Error, Result};

use crate::transport::{HttpRequest, HttpTransport};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// How tokens are obtained from the authority.
#[derive(Clone)]
pub enum Grant {
    /// App-only access with the client secret.
    ClientCredentials,
    /// Delegated access; the authority may rotate the refresh token.
    RefreshToken(Zeroizing<String>),
}

/// Immutable application credential.
#[derive(Clone)]
pub struct Credential {
    client_id: String,
    tenant_id: String,
    secret: Option<Zeroizing<String>>,
    token_url: TokenUrl,
    scope: String,
    grant: Grant,
}

impl Credential {
    /// # Errors
    /// - `InvalidInput` if `token_endpoint` is not a valid URL
    pub fn new(
        client_id: String,
        tenant_id: String,
        secret: Option<Zeroizing<String>>,
        token_endpoint: String,
        scope: String,
        grant: Grant,
    ) -> Result<Self> {
        let token_url = TokenUrl::new(token_endpoint)
            .map_err(|e| Error::InvalidInput(format!("Invalid token endpoint: {}", e)))?;
        Ok(Self {
            client_id,
            tenant_id,
            secret,
            token_url,
            scope,
            grant,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn token_endpoint(&self) -> &str {
        self.token_url.url().as_str()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let grant = match self.grant {
            Grant::ClientCredentials => "client_credentials",
            Grant::RefreshToken(_) => "refresh_token",
        };
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .field("token_endpoint", &self.token_endpoint())
            .field("grant", &grant)
            .finish_non_exhaustive()
    }
}

/// Extract the tenant from `https://login.microsoftonline.com/<tenant>/oauth2/...`.
pub fn tenant_from_token_endpoint(endpoint: &str) -> Option<String> {
    let url = url::Url::parse(endpoint).ok()?;
    let segments: Vec<&str> = url.path_segments()?.collect();
    let oauth_at = segments.iter().position(|s| *s == "oauth2")?;
    if oauth_at == 0 {
        return None;
    }
    let tenant = segments[oauth_at - 1];
    (!tenant.is_empty()).then(|| tenant.to_string())
}

/// Bearer token with its expiry.
#[derive(Clone)]
pub struct AccessToken {
    value: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token expires within `margin` from now.
    pub fn expires_within(&self, margin: chrono::Duration) -> bool {
        match self.expires_at.checked_sub_signed(margin) {
            Some(deadline) => deadline <= Utc::now(),
            None => true,
        }
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        *self.value == *other.value
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone)]
struct Refreshed {
    token: AccessToken,
    rotated_refresh_token: Option<Zeroizing<String>>,
}

type RefreshOutcome = std::result::Result<Refreshed, String>;

enum TokenState {
    Empty,
    Valid(AccessToken),
    Refreshing {
        epoch: u64,
        refresh: Shared<BoxFuture<'static, RefreshOutcome>>,
    },
}

struct TokenSlot {
    state: TokenState,
    epoch: u64,
    refresh_token: Option<Zeroizing<String>>,
}

/// Performs the token request against the authority.
struct TokenExchange {
    credential: Credential,
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl TokenExchange {
    async fn request_token(&self, refresh_token: Option<Zeroizing<String>>) -> RefreshOutcome {
        let credential = &self.credential;
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", credential.client_id.as_str()),
            ("scope", credential.scope.as_str()),
        ];
        if let Some(secret) = &credential.secret {
            form.push(("client_secret", secret.as_str()));
        }
        match &credential.grant {
            Grant::ClientCredentials => form.push(("grant_type", "client_credentials")),
            Grant::RefreshToken(initial) => {
                let current = refresh_token.as_ref().unwrap_or(initial);
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", current.as_str()));
            }
        }

        let request = HttpRequest::new(Method::POST, credential.token_endpoint())
            .form(&form)
            .timeout(self.timeout);

        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| format!("Token request failed: {}", e))?;

        if !response.is_success() {
            let detail = match serde_json::from_slice::<BasicErrorResponse>(&response.body) {
                Ok(err) => err.to_string(),
                Err(_) => String::from_utf8_lossy(&response.body).into_owned(),
            };
            return Err(format!(
                "Token request rejected with status {}: {}",
                response.status, detail
            ));
        }

        let body: BasicTokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| format!("Invalid token response: {}", e))?;

        let lifetime = body.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::hours(1));

        Ok(Refreshed {
            token: AccessToken::new(body.access_token().secret().clone(), expires_at),
            rotated_refresh_token: body
                .refresh_token()
                .map(|t| Zeroizing::new(t.secret().clone())),
        })
    }
}

/// Token manager that refreshes the access token before it expires.
pub struct TokenManager {
    exchange: Arc<TokenExchange>,
    safety_margin: chrono::Duration,
    slot: Mutex<TokenSlot>,
}

impl TokenManager {
    /// Create a token manager; no token is requested until first use.
    pub fn new(
        credential: Credential,
        transport: Arc<dyn HttpTransport>,
        safety_margin: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            exchange: Arc::new(TokenExchange {
                credential,
                transport,
                timeout,
            }),
            safety_margin: chrono::Duration::from_std(safety_margin)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            slot: Mutex::new(TokenSlot {
                state: TokenState::Empty,
                epoch: 0,
                refresh_token: None,
            }),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.exchange.credential
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Postconditions
    /// - The returned token does not expire within the safety margin
    /// - Concurrent callers share a single refresh
    ///
    /// # Errors
    /// - `Authentication` if the refresh failed; the failure is not cached
    pub async fn get_token(&self) -> Result<AccessToken> {
        let (epoch, refresh) = {
            let mut slot = self.slot.lock().await;
            match &slot.state {
                TokenState::Valid(token) if !token.expires_within(self.safety_margin) => {
                    return Ok(token.clone());
                }
                TokenState::Refreshing { epoch, refresh } => (*epoch, refresh.clone()),
                _ => {
                    slot.epoch += 1;
                    let epoch = slot.epoch;
                    let exchange = Arc::clone(&self.exchange);
                    let refresh_token = slot.refresh_token.clone();
                    info!(
                        tenant = %exchange.credential.tenant_id,
                        "Refreshing access token"
                    );
                    let refresh = async move { exchange.request_token(refresh_token).await }
                        .boxed()
                        .shared();
                    slot.state = TokenState::Refreshing {
                        epoch,
                        refresh: refresh.clone(),
                    };
                    (epoch, refresh)
                }
            }
        };

        let outcome = refresh.await;

        let mut slot = self.slot.lock().await;
        let current = matches!(
            &slot.state,
            TokenState::Refreshing { epoch: e, .. } if *e == epoch
        );
        if current {
            match &outcome {
                Ok(refreshed) => {
                    if let Some(rotated) = &refreshed.rotated_refresh_token {
                        slot.refresh_token = Some(rotated.clone());
                    }
                    debug!(expires_at = %refreshed.token.expires_at, "Access token refreshed");
                    slot.state = TokenState::Valid(refreshed.token.clone());
                }
                Err(message) => {
                    warn!(error = %message, "Access token refresh failed");
                    slot.state = TokenState::Empty;
                }
            }
        }

        outcome.map(|r| r.token).map_err(Error::Authentication)
    }

    /// Drop the cached token if it is the one the server just rejected.
    ///
    /// A token refreshed by another caller in the meantime is kept.
    pub async fn invalidate(&self, rejected: &AccessToken) {
        let mut slot = self.slot.lock().await;
        if let TokenState::Valid(current) = &slot.state {
            if current == rejected {
                debug!("Discarding rejected access token");
                slot.state = TokenState::Empty;
            }
        }
    }
}
