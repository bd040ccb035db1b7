//! Configuration for the Graph drive filesystem.
//!
//! Everything here deserializes from partial JSON: policy sections carry
//! `#[serde(default)]`, so a config only has to name what it overrides.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

use graphfs_common::{Error, Result};

use crate::auth::{tenant_from_token_endpoint, Credential, Grant};
pub use crate::retry::RetryConfig;

/// Environment variable holding the application (client) id.
pub const ENV_CLIENT_ID: &str = "MSGRAPHFS_CLIENT_ID";
/// Environment variable holding the directory (tenant) id.
pub const ENV_TENANT_ID: &str = "MSGRAPHFS_TENANT_ID";
/// Environment variable holding the client secret.
pub const ENV_CLIENT_SECRET: &str = "MSGRAPHFS_CLIENT_SECRET";

/// Microsoft Graph v1.0 endpoint.
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
/// Scope requested by the client-credentials grant.
pub const DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Upload chunks must be a multiple of this many bytes.
pub const UPLOAD_CHUNK_ALIGNMENT: usize = 320 * 1024;
/// Largest chunk the upload endpoint accepts in one request.
pub const MAX_UPLOAD_CHUNK: usize = 60 * 1024 * 1024;

const MIB: usize = 1024 * 1024;

/// Authentication parameters as supplied by the caller.
///
/// Missing values fall back to the `MSGRAPHFS_*` environment variables when
/// resolved; explicit values always win.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthParams {
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(skip_serializing, deserialize_with = "secret")]
    pub client_secret: Option<Zeroizing<String>>,
    /// Overrides `https://login.microsoftonline.com/<tenant>/oauth2/v2.0/token`.
    pub token_endpoint: Option<String>,
    /// Switches to the delegated refresh-token grant.
    #[serde(skip_serializing, deserialize_with = "secret")]
    pub refresh_token: Option<Zeroizing<String>>,
    pub scope: Option<String>,
}

fn secret<'de, D>(deserializer: D) -> std::result::Result<Option<Zeroizing<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(Zeroizing::new))
}

impl fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthParams")
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("token_endpoint", &self.token_endpoint)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("scope", &self.scope)
            .finish()
    }
}

impl AuthParams {
    /// Client-credentials parameters for a tenant.
    pub fn client_credentials(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            tenant_id: Some(tenant_id.into()),
            client_secret: Some(Zeroizing::new(client_secret.into())),
            ..Self::default()
        }
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<Credential> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve into an immutable [`Credential`], reading fallbacks from `env`.
    ///
    /// # Errors
    /// - `InvalidInput` if the client id, the tenant (or a token endpoint
    ///   naming it), or the secret of a client-credentials grant is missing
    pub fn resolve_with<F>(&self, env: F) -> Result<Credential>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let non_empty_secret = |v: &Option<Zeroizing<String>>| v.clone().filter(|s| !s.is_empty());

        let client_id = non_empty(&self.client_id)
            .or_else(|| env(ENV_CLIENT_ID))
            .ok_or_else(|| {
                Error::InvalidInput(format!("Missing client id (set {})", ENV_CLIENT_ID))
            })?;

        let tenant_id = non_empty(&self.tenant_id)
            .or_else(|| env(ENV_TENANT_ID))
            .or_else(|| {
                self.token_endpoint
                    .as_deref()
                    .and_then(tenant_from_token_endpoint)
            })
            .ok_or_else(|| {
                Error::InvalidInput(format!("Missing tenant id (set {})", ENV_TENANT_ID))
            })?;

        let token_endpoint = non_empty(&self.token_endpoint).unwrap_or_else(|| {
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant_id
            )
        });

        let secret = non_empty_secret(&self.client_secret)
            .or_else(|| env(ENV_CLIENT_SECRET).map(Zeroizing::new));
        let scope = non_empty(&self.scope).unwrap_or_else(|| DEFAULT_SCOPE.to_string());

        let grant = match non_empty_secret(&self.refresh_token) {
            Some(token) => Grant::RefreshToken(token),
            None => {
                if secret.is_none() {
                    return Err(Error::InvalidInput(format!(
                        "Missing client secret (set {})",
                        ENV_CLIENT_SECRET
                    )));
                }
                Grant::ClientCredentials
            }
        };

        Credential::new(
            client_id,
            tenant_id,
            secret,
            token_endpoint,
            scope,
            grant,
        )
    }
}

/// Freshness and paging of the path cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// How long a cached item or listing is served without re-validation.
    pub freshness: Duration,
    /// `$top` for children listings.
    pub page_size: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(60),
            page_size: 200,
        }
    }
}

/// Sizes and timeouts for content transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    /// Bytes per upload-session chunk.
    pub chunk_size: usize,
    /// Files up to this size are uploaded with a single request.
    pub small_file_threshold: usize,
    /// Readahead of a read stream.
    pub read_block_size: usize,
    pub request_timeout: Duration,
    /// Upper bound on cancelling an upload session.
    pub abort_timeout: Duration,
    /// How long to wait for a server-side copy to finish.
    pub copy_timeout: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 10 * MIB,
            small_file_threshold: 4 * MIB,
            read_block_size: 10 * MIB,
            request_timeout: Duration::from_secs(60),
            abort_timeout: Duration::from_secs(10),
            copy_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Complete filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub auth: AuthParams,
    /// Graph endpoint, without a trailing slash.
    pub graph_url: String,
    pub cache: CachePolicy,
    pub transfer: TransferPolicy,
    pub retry: RetryConfig,
    /// Tokens are considered expired this long before their stated expiry.
    pub token_safety_margin: Duration,
    /// Send deletions to the recycle bin instead of deleting permanently.
    pub use_recycle_bin: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            auth: AuthParams::default(),
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            cache: CachePolicy::default(),
            transfer: TransferPolicy::default(),
            retry: RetryConfig::default(),
            token_safety_margin: Duration::from_secs(5 * 60),
            use_recycle_bin: false,
        }
    }
}

impl DriveConfig {
    /// Configuration with default policies and the given credentials.
    pub fn new(auth: AuthParams) -> Self {
        Self {
            auth,
            ..Self::default()
        }
    }

    /// Check policy values for consistency.
    ///
    /// Credentials are checked separately by [`AuthParams::resolve`].
    pub fn validate(&self) -> Result<()> {
        let chunk = self.transfer.chunk_size;
        if chunk == 0 || chunk % UPLOAD_CHUNK_ALIGNMENT != 0 {
            return Err(Error::InvalidInput(format!(
                "Chunk size {} is not a positive multiple of {} bytes",
                chunk, UPLOAD_CHUNK_ALIGNMENT
            )));
        }
        if chunk > MAX_UPLOAD_CHUNK {
            return Err(Error::InvalidInput(format!(
                "Chunk size {} exceeds the {} byte request limit",
                chunk, MAX_UPLOAD_CHUNK
            )));
        }
        if self.cache.page_size == 0 {
            return Err(Error::InvalidInput("Page size must be positive".to_string()));
        }
        if self.transfer.read_block_size == 0 {
            return Err(Error::InvalidInput(
                "Read block size must be positive".to_string(),
            ));
        }
        if self.graph_url.is_empty() || self.graph_url.ends_with('/') {
            return Err(Error::InvalidInput(format!(
                "Graph URL must be non-empty without a trailing slash: '{}'",
                self.graph_url
            )));
        }
        let transfer = &self.transfer;
        if [transfer.request_timeout, transfer.abort_timeout, transfer.copy_timeout]
            .iter()
            .any(Duration::is_zero)
        {
            return Err(Error::InvalidInput("Transfer timeouts must be positive".to_string()));
        }
        url::Url::parse(&self.graph_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid Graph URL: {}", e)))?;
        Ok(())
    }
}
