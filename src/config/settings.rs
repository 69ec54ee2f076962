use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{anyhow, bail};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::osm::overpass::BBOX_PLACEHOLDER;

/// Shortest accepted `SESSION_SECRET`, in bytes (HS256 key).
pub const MIN_SESSION_SECRET_LEN: usize = 32;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub static_dir: PathBuf,
    pub index_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            static_dir: PathBuf::from("static"),
            index_file: "map.html".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OAuthConfig {
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://www.openstreetmap.org/oauth2/authorize".to_string(),
            token_url: "https://www.openstreetmap.org/oauth2/token".to_string(),
            redirect_uri: None,
            scopes: ["read_prefs", "write_prefs", "write_api"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OsmConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for OsmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openstreetmap.org/api/0.6".to_string(),
            user_agent: concat!("osm_poi_editor/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OverpassConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for OverpassConfig {
    fn default() -> Self {
        Self {
            url: "https://overpass-api.de/api/interpreter".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChangesetConfig {
    pub comment: String,
    pub created_by: String,
    /// Keep one changeset open per user instead of one per request.
    #[serde(default)]
    pub reuse: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_hours: u64,
    pub secure_cookies: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24 * 7,
            secure_cookies: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Fetched once at startup and served from memory.
    OnBoot,
    /// Fetched from Overpass for the bounding box of every request.
    #[default]
    OnDemand,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LayerConfig {
    pub name: String,
    /// Overpass QL; on-demand layers use `{{bbox}}` where the box goes.
    pub query: String,
    #[serde(default)]
    pub fetch: FetchMode,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub osm: OsmConfig,
    #[serde(default)]
    pub overpass: OverpassConfig,
    pub changesets: ChangesetConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub layers: Vec<LayerConfig>,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind_address, self.server.port)
    }

    pub fn redirect_uri(&self) -> String {
        self.oauth
            .redirect_uri
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}/callback", self.server.port))
    }

    pub fn has_on_demand_layers(&self) -> bool {
        self.layers
            .iter()
            .any(|layer| layer.fetch == FetchMode::OnDemand)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.layers.is_empty() {
            bail!("At least one layer must be configured");
        }
        let mut names = HashSet::new();
        for layer in &self.layers {
            if layer.name.trim().is_empty() {
                bail!("Layer names must not be empty");
            }
            if !names.insert(layer.name.as_str()) {
                bail!("Layer '{}' is configured more than once", layer.name);
            }
            let has_placeholder = layer.query.contains(BBOX_PLACEHOLDER);
            match layer.fetch {
                FetchMode::OnDemand if !has_placeholder => bail!(
                    "Layer '{}' is fetched on demand but its query has no {} placeholder",
                    layer.name,
                    BBOX_PLACEHOLDER
                ),
                FetchMode::OnBoot if has_placeholder => bail!(
                    "Layer '{}' is fetched on boot but its query uses {}",
                    layer.name,
                    BBOX_PLACEHOLDER
                ),
                _ => {}
            }
        }
        if self.changesets.comment.trim().is_empty() {
            bail!("The changeset comment must not be empty");
        }
        if self.changesets.created_by.trim().is_empty() {
            bail!("The changeset created_by tag must not be empty");
        }
        if self.session.ttl_hours == 0 {
            bail!("The session TTL must be at least one hour");
        }
        url::Url::parse(&self.redirect_uri())
            .map_err(|err| anyhow!("Invalid redirect URI {}: {}", self.redirect_uri(), err))?;
        Ok(())
    }
}

/// Credentials read from the environment only, never from the config file.
pub struct Secrets {
    pub client_id: String,
    pub client_secret: SecretString,
    pub session_secret: SecretString,
}

impl Secrets {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_secret.expose_secret().len() < MIN_SESSION_SECRET_LEN {
            bail!(
                "SESSION_SECRET must be at least {} bytes long",
                MIN_SESSION_SECRET_LEN
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
