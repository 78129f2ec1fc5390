use crate::error::{ApiError, ApiResponse, ApiResult, CODE_SUCCESS};
use reqwest::{Client as HttpClient, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

/// Default timeout for regular requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default timeout for long-lived server-push streams
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the API, e.g. `https://pan.example.com/api`
    pub base_url: String,
    /// Timeout applied to each regular request
    pub timeout: Duration,
    /// Timeout applied to server-push streams
    pub stream_timeout: Duration,
    /// Tenant sent in the `X-Tenant-Id` header
    pub tenant_id: Option<String>,
    /// User agent string
    pub user_agent: String,
}

impl ClientConfig {
    /// Create a new configuration for the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            tenant_id: None,
            user_agent: format!("easypan-api/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Per-request options
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Attach the bearer token if one is set
    pub credential: bool,
    /// Override the client-wide timeout
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self {
            credential: true,
            timeout: None,
        }
    }

    pub fn no_credential(mut self) -> Self {
        self.credential = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP client for the EasyPan REST API
pub struct Client {
    pub(crate) http_client: HttpClient,
    config: ClientConfig,
    token: RwLock<Option<String>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: ClientConfig) -> ApiResult<Self> {
        Url::parse(&config.base_url)
            .map_err(|e| ApiError::Other(format!("Invalid base URL {}: {}", config.base_url, e)))?;

        let http_client = HttpClient::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()?;

        Ok(Self {
            http_client,
            config,
            token: RwLock::new(None),
        })
    }

    /// Get the client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Set the bearer token used for subsequent requests
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    /// Forget the bearer token
    pub async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    pub(crate) fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Attach tenant, credential and timeout to a request
    pub(crate) async fn prepare(&self, builder: RequestBuilder, opts: &RequestOptions) -> RequestBuilder {
        let mut builder = builder;
        if let Some(tenant) = &self.config.tenant_id {
            builder = builder.header("X-Tenant-Id", tenant);
        }
        if opts.credential {
            if let Some(token) = self.token.read().await.as_ref() {
                builder = builder.bearer_auth(token);
            }
        }
        if let Some(timeout) = opts.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// POST a form-encoded body and decode the response envelope
    pub(crate) async fn post_form<T, F>(
        &self,
        path: &str,
        form: &F,
        opts: RequestOptions,
    ) -> ApiResult<Option<T>>
    where
        T: DeserializeOwned,
        F: Serialize + ?Sized,
    {
        let url = self.build_url(path);
        tracing::trace!(target: "api", url = %url, "POST form");

        let builder = self.prepare(self.http_client.post(&url).form(form), &opts).await;
        self.execute(builder).await
    }

    /// Send a request and decode the response envelope
    pub(crate) async fn execute<T>(&self, builder: RequestBuilder) -> ApiResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(target: "api", status = %status, body = %body, "Request failed");
            return Err(ApiError::from_status(status, &body));
        }

        let api_response: ApiResponse<T> = response.json().await?;
        if api_response.code != CODE_SUCCESS {
            return Err(ApiError::from_response(api_response));
        }

        Ok(api_response.data)
    }
}
