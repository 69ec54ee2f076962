use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};

use crate::auth::{OAuthClient, SessionCodec};
use crate::config::{Config, FetchMode, LayerConfig, Secrets};
use crate::osm::api::OsmApi;
use crate::osm::bbox::BoundingBox;
use crate::osm::changeset::ChangesetManager;
use crate::osm::elements::Element;
use crate::osm::overpass::{OverpassClient, OverpassError};

use super::pending::PendingEdits;

/// Layer definitions plus the data of the layers fetched at startup.
pub struct LayerStore {
    layers: Vec<LayerConfig>,
    preloaded: RwLock<HashMap<String, Arc<Vec<Element>>>>,
}

impl LayerStore {
    pub fn new(layers: Vec<LayerConfig>) -> Self {
        Self {
            layers,
            preloaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn layers(&self) -> &[LayerConfig] {
        &self.layers
    }

    pub fn get(&self, name: &str) -> Option<&LayerConfig> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn store(&self, name: &str, elements: Vec<Element>) {
        self.preloaded
            .write()
            .insert(name.to_string(), Arc::new(elements));
    }

    /// Fetches every on-boot layer. Any failure aborts startup.
    pub async fn load_on_boot(&self, overpass: &OverpassClient) -> anyhow::Result<()> {
        for layer in self.layers.iter().filter(|l| l.fetch == FetchMode::OnBoot) {
            log::info!("Fetching layer '{}' at startup", layer.name);
            let elements = overpass
                .fetch_template(&layer.query, None)
                .await
                .with_context(|| format!("Could not load layer '{}'", layer.name))?;
            log::info!("Layer '{}' holds {} elements", layer.name, elements.len());
            self.store(&layer.name, elements);
        }
        Ok(())
    }

    /// Elements of `layer`, from memory or from Overpass for the given box.
    pub async fn elements(
        &self,
        overpass: &OverpassClient,
        layer: &LayerConfig,
        bbox: Option<&BoundingBox>,
    ) -> Result<Arc<Vec<Element>>, OverpassError> {
        match layer.fetch {
            FetchMode::OnBoot => {
                let preloaded = self.preloaded.read().get(&layer.name).cloned();
                Ok(preloaded.unwrap_or_default())
            }
            FetchMode::OnDemand => Ok(Arc::new(
                overpass.fetch_template(&layer.query, bbox).await?,
            )),
        }
    }
}

pub struct AppState {
    pub config: Config,
    pub layers: LayerStore,
    pub overpass: OverpassClient,
    pub osm: Arc<dyn OsmApi>,
    pub changesets: ChangesetManager,
    pub pending: PendingEdits,
    /// Serializes saves of the pending buffer.
    pub flush_lock: tokio::sync::Mutex<()>,
    pub oauth: OAuthClient,
    pub sessions: SessionCodec,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Config, secrets: &Secrets, osm: Arc<dyn OsmApi>) -> anyhow::Result<Self> {
        let overpass = OverpassClient::new(
            &config.overpass.url,
            &config.osm.user_agent,
            Duration::from_secs(config.overpass.timeout_secs),
        )?;
        let oauth = OAuthClient::new(
            &secrets.client_id,
            SecretString::from(secrets.client_secret.expose_secret().to_string()),
            &config.oauth.auth_url,
            &config.oauth.token_url,
            &config.redirect_uri(),
            &config.oauth.scopes,
            &config.osm.user_agent,
        )?;
        let sessions = SessionCodec::new(
            &secrets.session_secret,
            config.session.ttl_hours,
            config.session.secure_cookies,
        );
        let changesets = ChangesetManager::new(
            osm.clone(),
            &config.changesets.created_by,
            &config.changesets.comment,
            config.changesets.reuse,
        );
        Ok(Self {
            layers: LayerStore::new(config.layers.clone()),
            config,
            overpass,
            osm,
            changesets,
            pending: PendingEdits::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            oauth,
            sessions,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{http::StatusCode, response::IntoResponse, routing::post, Router};

    use super::*;

    async fn spawn_overpass(status: StatusCode, hits: Arc<AtomicUsize>) -> OverpassClient {
        let router = Router::new().route(
            "/api/interpreter",
            post(move |query: String| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    assert!(!query.contains("{{bbox}}"));
                    let body = r#"{"elements": [
                        {"type": "node", "id": 1, "lat": 44.4, "lon": 26.1, "tags": {"amenity": "drinking_water"}},
                        {"type": "node", "id": 2, "lat": 44.5, "lon": 26.2}
                    ]}"#;
                    (status, body).into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        OverpassClient::new(
            &format!("http://{}/api/interpreter", addr),
            "osm_poi_editor-test",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn layers() -> LayerStore {
        LayerStore::new(vec![
            LayerConfig {
                name: "water".to_string(),
                query: "[out:json];node[\"amenity\"=\"drinking_water\"];out;".to_string(),
                fetch: FetchMode::OnBoot,
            },
            LayerConfig {
                name: "ways".to_string(),
                query: "[out:json];way({{bbox}});out geom;".to_string(),
                fetch: FetchMode::OnDemand,
            },
        ])
    }

    #[tokio::test]
    async fn on_boot_layers_are_served_from_memory() {
        let hits = Arc::new(AtomicUsize::new(0));
        let overpass = spawn_overpass(StatusCode::OK, hits.clone()).await;
        let store = layers();

        store.load_on_boot(&overpass).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let water = store.get("water").unwrap();
        let elements = store.elements(&overpass, water, None).await.unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].id(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_on_boot_layer_names_the_layer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let overpass = spawn_overpass(StatusCode::INTERNAL_SERVER_ERROR, hits).await;
        let store = layers();

        let err = store.load_on_boot(&overpass).await.unwrap_err();
        assert!(err.to_string().contains("Could not load layer 'water'"));
        let water = store.get("water").unwrap();
        assert!(store.elements(&overpass, water, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_demand_layer_needs_a_bounding_box() {
        let hits = Arc::new(AtomicUsize::new(0));
        let overpass = spawn_overpass(StatusCode::OK, hits.clone()).await;
        let store = layers();
        let ways = store.get("ways").unwrap();

        let err = store.elements(&overpass, ways, None).await.unwrap_err();
        assert!(matches!(err, OverpassError::MissingBoundingBox));

        let bbox: BoundingBox = "44.4,26.0,44.5,26.2".parse().unwrap();
        let elements = store.elements(&overpass, ways, Some(&bbox)).await.unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
