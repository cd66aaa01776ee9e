//! Server list sources
//!
//! A source produces the full server list on demand. The HTTP source talks
//! to the provider API, the file source reads a local cache, and the static
//! source serves a fixed list.

use crate::catalog::CatalogConfig;
use crate::error::CatalogError;
use crate::types::{CatalogToken, Server};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Produces a complete server list
#[async_trait]
pub trait ServerSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Server>, CatalogError>;
}

/// Wire format shared by the API and the cache file
#[derive(Debug, Serialize, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

/// Fetches the server list from an HTTP(S) endpoint
pub struct HttpServerSource {
    client: Client,
    endpoint: Url,
    token: Option<CatalogToken>,
    cache_file: Option<PathBuf>,
}

impl HttpServerSource {
    /// Create a new HTTP source
    ///
    /// The token, if any, is sent as a bearer credential and never logged.
    pub fn new(
        endpoint: &str,
        token: Option<CatalogToken>,
        timeout: Duration,
    ) -> Result<Self, CatalogError> {
        let endpoint = Url::parse(endpoint).map_err(|e| CatalogError::FetchFailed {
            reason: format!("invalid endpoint URL: {}", e),
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| CatalogError::FetchFailed {
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint,
            token,
            cache_file: None,
        })
    }

    /// Write every successful fetch to `path`
    pub fn with_cache(mut self, path: PathBuf) -> Self {
        self.cache_file = Some(path);
        self
    }

    fn write_cache(&self, servers: &[Server]) {
        let Some(path) = &self.cache_file else {
            return;
        };
        let body = ServerList {
            servers: servers.to_vec(),
        };
        let result = serde_json::to_string(&body)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                std::fs::write(path, json).map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("Failed to update server cache {:?}: {}", path, e);
        }
    }
}

#[async_trait]
impl ServerSource for HttpServerSource {
    #[tracing::instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn fetch(&self) -> Result<Vec<Server>, CatalogError> {
        let mut request = self.client.get(self.endpoint.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CatalogError::FetchFailed {
                reason: e.to_string(),
            })?;

        let list: ServerList = response
            .json()
            .await
            .map_err(|e| CatalogError::FetchFailed {
                reason: format!("malformed server list: {}", e),
            })?;

        debug!(servers = list.servers.len(), "Fetched server list");
        self.write_cache(&list.servers);
        Ok(list.servers)
    }
}

/// Reads the server list from a JSON file
pub struct FileServerSource {
    path: PathBuf,
}

impl FileServerSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ServerSource for FileServerSource {
    async fn fetch(&self) -> Result<Vec<Server>, CatalogError> {
        let contents =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| CatalogError::FetchFailed {
                    reason: format!("failed to read {}: {}", self.path.display(), e),
                })?;

        let list: ServerList =
            serde_json::from_str(&contents).map_err(|e| CatalogError::FetchFailed {
                reason: format!("malformed server cache {}: {}", self.path.display(), e),
            })?;
        Ok(list.servers)
    }
}

/// Serves a fixed server list
pub struct StaticServerSource {
    servers: Vec<Server>,
}

impl StaticServerSource {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ServerSource for StaticServerSource {
    async fn fetch(&self) -> Result<Vec<Server>, CatalogError> {
        Ok(self.servers.clone())
    }
}

/// Pick the source described by the configuration
///
/// An endpoint wins over a bare cache file; the cache doubles as the write
/// target for the HTTP source.
pub fn source_from_config(
    config: &CatalogConfig,
    token: Option<CatalogToken>,
    default_cache: PathBuf,
) -> Result<Box<dyn ServerSource>, CatalogError> {
    let cache = config.cache_file.clone().unwrap_or(default_cache);

    match &config.endpoint {
        Some(endpoint) => {
            let source = HttpServerSource::new(
                endpoint,
                token,
                Duration::from_secs(config.fetch_timeout_secs),
            )?
            .with_cache(cache);
            Ok(Box::new(source))
        }
        None => Ok(Box::new(FileServerSource::new(cache))),
    }
}
