//! ICE server configuration with a time-bounded cache.

use crate::config::CoreConfig;
use crate::net::{HttpClient, HttpRequest};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// One STUN or TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// A fetched server list, optionally with the lifetime of its credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerList {
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// Where ICE servers and their ephemeral credentials come from.
#[async_trait]
pub trait IceServerSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<IceServerList>;
}

/// Fetches `{"iceServers": [...], "ttl": secs}` from an HTTP endpoint.
pub struct HttpIceServerSource {
    http: Arc<dyn HttpClient>,
    url: String,
    auth_token: Option<String>,
}

impl HttpIceServerSource {
    pub fn new(http: Arc<dyn HttpClient>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[async_trait]
impl IceServerSource for HttpIceServerSource {
    async fn fetch(&self) -> anyhow::Result<IceServerList> {
        let mut request = HttpRequest::get(&self.url);
        if let Some(token) = &self.auth_token {
            request = request.with_header("Authorization", format!("Bearer {token}"));
        }

        let response = self.http.execute(request).await?;
        if !response.is_success() {
            anyhow::bail!("ICE server endpoint returned {}", response.status_code);
        }
        response.json()
    }
}

#[derive(Debug, Clone)]
struct CachedIceServers {
    servers: Vec<IceServer>,
    ttl: Duration,
    fetched_at: Instant,
}

impl CachedIceServers {
    fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// Hands out ICE servers, refreshing from the source when the cache expires.
pub struct IceConfigProvider {
    source: Arc<dyn IceServerSource>,
    default_ttl: Duration,
    fallback: Vec<IceServer>,
    cached: RwLock<Option<CachedIceServers>>,
}

impl IceConfigProvider {
    pub fn new(source: Arc<dyn IceServerSource>, config: &CoreConfig) -> Self {
        Self {
            source,
            default_ttl: config.ice_cache_ttl(),
            fallback: config.fallback_ice_servers.clone(),
            cached: RwLock::new(None),
        }
    }

    /// Current server list. Never fails: on fetch errors a stale cache or the
    /// configured fallback is returned instead.
    pub async fn ice_servers(&self) -> Vec<IceServer> {
        self.refresh(false).await
    }

    pub async fn refresh(&self, force: bool) -> Vec<IceServer> {
        {
            let guard = self.cached.read().await;
            if !force
                && let Some(cached) = &*guard
                && !cached.is_expired()
            {
                return cached.servers.clone();
            }
        }

        match self.source.fetch().await {
            Ok(list) => {
                let ttl = list
                    .ttl
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_ttl);
                info!(
                    "Fetched {} ICE servers (ttl {}s)",
                    list.ice_servers.len(),
                    ttl.as_secs()
                );
                let mut guard = self.cached.write().await;
                *guard = Some(CachedIceServers {
                    servers: list.ice_servers.clone(),
                    ttl,
                    fetched_at: Instant::now(),
                });
                list.ice_servers
            }
            Err(e) => {
                let guard = self.cached.read().await;
                if let Some(stale) = &*guard {
                    warn!("ICE server refresh failed, reusing stale list: {e}");
                    stale.servers.clone()
                } else {
                    warn!("ICE server fetch failed, using fallback servers: {e}");
                    self.fallback.clone()
                }
            }
        }
    }

    pub async fn invalidate(&self) {
        debug!("Invalidating cached ICE servers");
        *self.cached.write().await = None;
    }
}

/// A source that always returns the same list, for hosts with static servers.
pub struct StaticIceServers(pub Vec<IceServer>);

#[async_trait]
impl IceServerSource for StaticIceServers {
    async fn fetch(&self) -> anyhow::Result<IceServerList> {
        Ok(IceServerList {
            ice_servers: self.0.clone(),
            ttl: None,
        })
    }
}
