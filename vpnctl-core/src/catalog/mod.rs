//! Server catalog
//!
//! Holds the current server list and answers selection queries. The list
//! comes from a [`ServerSource`] and is swapped atomically on refresh, so a
//! reader always sees either the old or the new list in full.

use crate::error::CatalogError;
use crate::types::{Feature, Protocol, Server};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub mod source;

pub use source::{
    source_from_config, FileServerSource, HttpServerSource, ServerSource, StaticServerSource,
};

/// Where and how the server list is fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// HTTP(S) endpoint returning the server list as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Local cache of the last successful fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<PathBuf>,

    /// Request timeout for the HTTP fetch
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_fetch_timeout() -> u64 {
    15
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            cache_file: None,
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl CatalogConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(endpoint) = &self.endpoint {
            match url::Url::parse(endpoint) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => {
                    return Err(format!(
                        "endpoint scheme must be http or https, got: {}",
                        url.scheme()
                    ))
                }
                Err(e) => return Err(format!("invalid endpoint URL: {}", e)),
            }
        }

        if self.fetch_timeout_secs == 0 || self.fetch_timeout_secs > 300 {
            return Err(format!(
                "fetch_timeout_secs must be between 1 and 300, got: {}",
                self.fetch_timeout_secs
            ));
        }

        Ok(())
    }
}

/// In-memory server catalog
pub struct ServerCatalog {
    source: Box<dyn ServerSource>,
    servers: RwLock<Arc<Vec<Server>>>,
    max_tier: u8,
}

impl ServerCatalog {
    /// Create an empty catalog fed by `source`
    ///
    /// Servers whose tier exceeds `max_tier` are never selected.
    pub fn new(source: Box<dyn ServerSource>, max_tier: u8) -> Self {
        Self {
            source,
            servers: RwLock::new(Arc::new(Vec::new())),
            max_tier,
        }
    }

    /// Create a catalog pre-populated with a fixed list
    pub fn with_servers(servers: Vec<Server>, max_tier: u8) -> Self {
        let catalog = Self::new(Box::new(StaticServerSource::new(servers.clone())), max_tier);
        catalog.replace(servers);
        catalog
    }

    /// Fetch a new server list and swap it in
    ///
    /// A failed or invalid fetch leaves the current list untouched.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Arc<Vec<Server>>, CatalogError> {
        let fetched = self.source.fetch().await.map_err(|e| {
            warn!("Server list refresh failed: {}", e);
            e
        })?;

        validate_servers(&fetched)?;

        let count = fetched.len();
        let snapshot = self.replace(fetched);
        info!(servers = count, "Server catalog refreshed");
        Ok(snapshot)
    }

    /// Current snapshot of the server list
    pub fn servers(&self) -> Arc<Vec<Server>> {
        Arc::clone(&self.servers.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn is_empty(&self) -> bool {
        self.servers().is_empty()
    }

    /// Least loaded eligible server
    ///
    /// Ties are broken by lower latency, then by id so the result is
    /// deterministic.
    pub fn fastest(&self, protocol: Protocol) -> Result<Server, CatalogError> {
        let servers = self.servers();
        let server = pick_fastest(self.eligible(&servers, protocol))
            .ok_or(CatalogError::NoServerAvailable { protocol })?;
        debug!(server = %server.id, %protocol, "Selected fastest server");
        Ok(server.clone())
    }

    /// Uniformly random eligible server
    pub fn random(&self, protocol: Protocol) -> Result<Server, CatalogError> {
        let servers = self.servers();
        let eligible: Vec<&Server> = self.eligible(&servers, protocol).collect();
        let server = eligible
            .choose(&mut rand::thread_rng())
            .ok_or(CatalogError::NoServerAvailable { protocol })?;
        debug!(server = %server.id, %protocol, "Selected random server");
        Ok((*server).clone())
    }

    /// Look a server up by id
    pub fn by_id(&self, id: &str) -> Result<Server, CatalogError> {
        let servers = self.servers();
        let server = servers
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CatalogError::NotFound { id: id.to_string() })?;

        if server.tier > self.max_tier {
            return Err(CatalogError::TierRestricted {
                id: server.id.clone(),
                tier: server.tier,
            });
        }
        Ok(server.clone())
    }

    /// Eligible servers offering `feature`, sorted fastest first
    pub fn with_feature(&self, feature: Feature, protocol: Protocol) -> Vec<Server> {
        let servers = self.servers();
        let mut matching: Vec<Server> = self
            .eligible(&servers, protocol)
            .filter(|s| s.features.has(feature))
            .cloned()
            .collect();
        matching.sort_by(|a, b| speed_key(a).cmp(&speed_key(b)));
        matching
    }

    /// Fastest eligible server offering `feature`
    pub fn fastest_with_feature(
        &self,
        feature: Feature,
        protocol: Protocol,
    ) -> Result<Server, CatalogError> {
        self.with_feature(feature, protocol)
            .into_iter()
            .next()
            .ok_or(CatalogError::NoServerAvailable { protocol })
    }

    fn eligible<'a>(
        &self,
        servers: &'a [Server],
        protocol: Protocol,
    ) -> impl Iterator<Item = &'a Server> {
        let max_tier = self.max_tier;
        servers
            .iter()
            .filter(move |s| s.supports(protocol) && s.tier <= max_tier)
    }

    fn replace(&self, servers: Vec<Server>) -> Arc<Vec<Server>> {
        let snapshot = Arc::new(servers);
        *self.servers.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&snapshot);
        snapshot
    }
}

fn speed_key(server: &Server) -> (u8, u32, &str) {
    (server.load, server.latency_ms, server.id.as_str())
}

fn pick_fastest<'a>(servers: impl Iterator<Item = &'a Server>) -> Option<&'a Server> {
    servers.min_by(|a, b| speed_key(a).cmp(&speed_key(b)))
}

/// Reject lists that would leave the catalog in a broken state
fn validate_servers(servers: &[Server]) -> Result<(), CatalogError> {
    if servers.is_empty() {
        return Err(CatalogError::FetchFailed {
            reason: "server list is empty".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for server in servers {
        if server.id.trim().is_empty() {
            return Err(CatalogError::FetchFailed {
                reason: "server with empty id".to_string(),
            });
        }
        if !seen.insert(server.id.as_str()) {
            return Err(CatalogError::FetchFailed {
                reason: format!("duplicate server id {}", server.id),
            });
        }
        if server.load > 100 {
            return Err(CatalogError::FetchFailed {
                reason: format!("server {} reports load {}%", server.id, server.load),
            });
        }
        if server.protocols.is_empty() {
            return Err(CatalogError::FetchFailed {
                reason: format!("server {} supports no protocol", server.id),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerFeatures;

    fn server(id: &str, load: u8, latency_ms: u32, protocols: &[Protocol]) -> Server {
        Server {
            id: id.to_string(),
            country: "CH".to_string(),
            load,
            latency_ms,
            protocols: protocols.to_vec(),
            features: ServerFeatures::default(),
            tier: 0,
        }
    }

    #[test]
    fn test_fastest_breaks_ties_by_latency_then_id() {
        let catalog = ServerCatalog::with_servers(
            vec![
                server("B", 10, 40, &[Protocol::Udp]),
                server("A", 10, 40, &[Protocol::Udp]),
                server("C", 10, 20, &[Protocol::Udp]),
            ],
            0,
        );
        assert_eq!(catalog.fastest(Protocol::Udp).unwrap().id, "C");

        let catalog = ServerCatalog::with_servers(
            vec![
                server("B", 10, 40, &[Protocol::Udp]),
                server("A", 10, 40, &[Protocol::Udp]),
            ],
            0,
        );
        assert_eq!(catalog.fastest(Protocol::Udp).unwrap().id, "A");
    }

    #[test]
    fn test_tier_restriction() {
        let mut plus = server("PLUS#1", 5, 10, &[Protocol::Udp]);
        plus.tier = 2;
        let catalog =
            ServerCatalog::with_servers(vec![plus, server("FREE#1", 90, 10, &[Protocol::Udp])], 0);

        assert_eq!(catalog.fastest(Protocol::Udp).unwrap().id, "FREE#1");
        assert_eq!(
            catalog.by_id("PLUS#1"),
            Err(CatalogError::TierRestricted {
                id: "PLUS#1".to_string(),
                tier: 2
            })
        );
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let servers = vec![
            server("A", 10, 0, &[Protocol::Tcp]),
            server("A", 20, 0, &[Protocol::Tcp]),
        ];
        assert!(matches!(
            validate_servers(&servers),
            Err(CatalogError::FetchFailed { .. })
        ));
    }
}
