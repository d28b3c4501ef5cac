//! Client of the platform REST API

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform returned error {errcode}: {errmsg}")]
    Api { errcode: i64, errmsg: String },
}

/// Storage of the access token
pub trait TokenCache: Send + Sync {
    /// Returns the token unless it is missing or expired.
    fn get(&self) -> Option<String>;
    fn set(&self, value: String, ttl: Duration);
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// In-process token cache
pub struct MemoryTokenCache {
    entry: Mutex<Option<CachedToken>>,
    now: Clock,
}

struct CachedToken {
    value: String,
    /// Unix timestamp in seconds
    expires_at: i64,
}

impl Default for MemoryTokenCache {
    fn default() -> Self {
        Self::with_clock(|| chrono::Utc::now().timestamp())
    }
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(now: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            entry: Mutex::new(None),
            now: Arc::new(now),
        }
    }
}

impl TokenCache for MemoryTokenCache {
    fn get(&self) -> Option<String> {
        let entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        entry
            .as_ref()
            .filter(|token| (self.now)() <= token.expires_at)
            .map(|token| token.value.clone())
    }

    fn set(&self, value: String, ttl: Duration) {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = (self.now)().saturating_add(ttl);
        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(CachedToken { value, expires_at });
    }
}

/// `errcode`/`errmsg` pair carried by every response
#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: Option<i64>,
    #[serde(default)]
    errmsg: Option<String>,
}

impl ApiStatus {
    fn is_ok(&self) -> bool {
        match self.errcode {
            Some(errcode) => errcode == 0,
            None => self.errmsg.as_deref() == Some("ok"),
        }
    }

    fn into_error(self) -> ApiError {
        ApiError::Api {
            errcode: self.errcode.unwrap_or(-1),
            errmsg: self.errmsg.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    errcode: Option<i64>,
    #[serde(default)]
    errmsg: Option<String>,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    cache: Box<dyn TokenCache>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        Self::with_cache(config, MemoryTokenCache::new())
    }

    pub fn with_cache(config: &Config, cache: impl TokenCache + 'static) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base.trim_end_matches('/').to_owned(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            cache: Box::new(cache),
        })
    }

    /// Returns the cached access token or fetches a new one.
    pub async fn access_token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }

        let response: TokenResponse = self
            .client
            .get(format!("{}/token", self.base_url))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.access_token {
            Some(token) if !token.is_empty() => {
                info!(expires_in = response.expires_in, "fetched access token");
                self.cache
                    .set(token.clone(), Duration::from_secs(response.expires_in));
                Ok(token)
            }
            _ => Err(ApiStatus {
                errcode: response.errcode,
                errmsg: response.errmsg,
            }
            .into_error()),
        }
    }

    /// Replaces the custom menu with the given JSON definition.
    pub async fn create_menu(&self, menu: &str) -> Result<(), ApiError> {
        let token = self.access_token().await?;
        let status: ApiStatus = self
            .client
            .post(format!("{}/menu/create", self.base_url))
            .query(&[("access_token", &token)])
            .header(CONTENT_TYPE, "application/json")
            .body(menu.to_owned())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !status.is_ok() {
            return Err(status.into_error());
        }
        debug!("menu created");
        Ok(())
    }

    /// Fetches the current custom menu.
    pub async fn get_menu(&self) -> Result<serde_json::Value, ApiError> {
        let token = self.access_token().await?;
        let menu: serde_json::Value = self
            .client
            .get(format!("{}/menu/get", self.base_url))
            .query(&[("access_token", &token)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(errcode) = menu.get("errcode").and_then(|v| v.as_i64()) {
            if errcode != 0 {
                let errmsg = menu
                    .get("errmsg")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned();
                return Err(ApiError::Api { errcode, errmsg });
            }
        }
        Ok(menu)
    }
}
