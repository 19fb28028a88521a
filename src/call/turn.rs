//! ICE server discovery. TURN/STUN credentials come from the backend; any
//! failure falls back to public Google STUN so a call can still be attempted.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialsResponse {
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServer>,
}

/// The RTCConfiguration equivalent handed to every new peer connection.
#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub servers: Vec<IceServer>,
    pub candidate_pool_size: u32,
    pub bundle_policy: &'static str,
    pub rtcp_mux_policy: &'static str,
    pub transport_policy: &'static str,
}

impl IceServerConfig {
    fn with_servers(servers: Vec<IceServer>) -> Self {
        IceServerConfig {
            servers,
            candidate_pool_size: 10,
            bundle_policy: "max-bundle",
            rtcp_mux_policy: "require",
            transport_policy: "all",
        }
    }

    /// Public STUN only, used whenever the credentials endpoint is
    /// unreachable or returns junk.
    pub fn fallback() -> Self {
        Self::with_servers(vec![
            IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            },
            IceServer {
                urls: vec!["stun:stun1.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            },
        ])
    }

    /// No servers at all: gathering stays host-only. Keeps unit tests off
    /// the network.
    #[cfg(test)]
    pub(crate) fn host_only() -> Self {
        Self::with_servers(Vec::new())
    }

    /// First STUN url as `host:port`, for server-reflexive gathering.
    /// TURN urls qualify too since every TURN server answers bindings.
    pub fn stun_host(&self) -> Option<String> {
        for server in &self.servers {
            for url in &server.urls {
                let Some(rest) = url
                    .strip_prefix("stun:")
                    .or_else(|| url.strip_prefix("turn:"))
                else {
                    continue;
                };
                // Strip ?transport=udp style suffixes.
                let rest = rest.split('?').next().unwrap_or(rest);
                if rest.contains(':') {
                    return Some(rest.to_string());
                }
                return Some(format!("{rest}:3478"));
            }
        }
        None
    }
}

async fn request_credentials(http: &reqwest::Client, api_base: &str) -> Result<IceServerConfig> {
    let url = format!("{}/turn/credentials", api_base.trim_end_matches('/'));
    let response = http
        .get(&url)
        .send()
        .await
        .context("credentials request failed")?
        .error_for_status()
        .context("credentials endpoint returned an error")?;
    let body: CredentialsResponse = response
        .json()
        .await
        .context("credentials response was not valid JSON")?;
    if body.ice_servers.is_empty() {
        anyhow::bail!("credentials response listed no servers");
    }
    Ok(IceServerConfig::with_servers(body.ice_servers))
}

/// Fetches TURN credentials from the backend, falling back to public STUN on
/// any failure. Never errors: a degraded config beats no call at all.
pub async fn fetch_ice_servers(http: &reqwest::Client, api_base: &str) -> IceServerConfig {
    match request_credentials(http, api_base).await {
        Ok(config) => {
            debug!("using {} ICE server entries from backend", config.servers.len());
            config
        }
        Err(e) => {
            warn!("TURN credential fetch failed, using public STUN: {e:#}");
            IceServerConfig::fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_is_stun_only() {
        let config = IceServerConfig::fallback();
        assert_eq!(config.servers.len(), 2);
        assert!(config
            .servers
            .iter()
            .all(|s| s.urls[0].starts_with("stun:") && s.username.is_none()));
        assert_eq!(config.candidate_pool_size, 10);
        assert_eq!(config.bundle_policy, "max-bundle");
    }

    #[test]
    fn test_stun_host_extraction() {
        let config = IceServerConfig::fallback();
        assert_eq!(config.stun_host().as_deref(), Some("stun.l.google.com:19302"));

        let no_port = IceServerConfig::with_servers(vec![IceServer {
            urls: vec!["stun:stun.example.org".to_string()],
            username: None,
            credential: None,
        }]);
        assert_eq!(no_port.stun_host().as_deref(), Some("stun.example.org:3478"));

        let turn = IceServerConfig::with_servers(vec![IceServer {
            urls: vec!["turn:relay.example.org:443?transport=udp".to_string()],
            username: Some("u".into()),
            credential: Some("c".into()),
        }]);
        assert_eq!(turn.stun_host().as_deref(), Some("relay.example.org:443"));
    }

    #[test]
    fn test_credentials_response_shape() {
        let body = r#"{"iceServers":[{"urls":["turn:relay:3478"],"username":"u","credential":"c"}]}"#;
        let parsed: CredentialsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.ice_servers.len(), 1);
        assert_eq!(parsed.ice_servers[0].username.as_deref(), Some("u"));
    }
}
