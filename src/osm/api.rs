//! Client for the OpenStreetMap editing API (version 0.6).
//!
//! [`OsmApi`] is the boundary between the changeset logic and HTTP, so the
//! retry behaviour can be exercised without a network. [`HttpOsmApi`] is the
//! real implementation backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::elements::{ApiElementResponse, Element, ElementId, ElementKind};
use super::payload::ChangesetId;

/// Marker OSM puts in the body of a 409 answer for a closed or expired changeset.
const CHANGESET_CLOSED_MARKER: &str = "The changeset";

#[derive(Error, Debug)]
pub enum OsmApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} answered with status {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("{kind} {id} was not found")]
    NotFound { kind: ElementKind, id: ElementId },
}

impl OsmApiError {
    /// True when the write was refused because its changeset is no longer open.
    pub fn is_changeset_closed(&self) -> bool {
        match self {
            OsmApiError::Status { status, body, .. } => {
                *status == StatusCode::CONFLICT.as_u16() && body.contains(CHANGESET_CLOSED_MARKER)
            }
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            OsmApiError::Status { status, .. } => Some(*status),
            OsmApiError::NotFound { .. } => Some(StatusCode::NOT_FOUND.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetCount {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDetails {
    pub id: u64,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changesets: Option<ChangesetCount>,
}

#[derive(Deserialize)]
struct UserDetailsResponse {
    user: UserDetails,
}

#[async_trait]
pub trait OsmApi: Send + Sync {
    /// Opens a changeset and returns its ID.
    async fn create_changeset(&self, token: &str, xml: String)
        -> Result<ChangesetId, OsmApiError>;

    async fn close_changeset(&self, token: &str, changeset: ChangesetId)
        -> Result<(), OsmApiError>;

    /// PUTs an element document to `path` (relative to the API base) and
    /// returns the response body: the new ID for creates, the new version for updates.
    async fn write(&self, token: &str, path: &str, xml: String) -> Result<String, OsmApiError>;

    async fn fetch_element(&self, kind: ElementKind, id: ElementId)
        -> Result<Element, OsmApiError>;

    async fn user_details(&self, token: &str) -> Result<UserDetails, OsmApiError>;
}

pub struct HttpOsmApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOsmApi {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends the request and returns the body of a 200 answer.
    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        token: Option<&str>,
        xml: Option<String>,
    ) -> Result<String, OsmApiError> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(xml) = xml {
            request = request.header(header::CONTENT_TYPE, "text/xml").body(xml);
        } else if method == reqwest::Method::PUT {
            request = request.header(header::CONTENT_LENGTH, 0);
        }

        let transport = |source| OsmApiError::Transport {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if status != StatusCode::OK {
            return Err(OsmApiError::Status {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl OsmApi for HttpOsmApi {
    async fn create_changeset(
        &self,
        token: &str,
        xml: String,
    ) -> Result<ChangesetId, OsmApiError> {
        let url = self.url("changeset/create");
        let body = self
            .send(reqwest::Method::PUT, &url, Some(token), Some(xml))
            .await?;
        let changeset = body.trim().parse().map_err(|_| OsmApiError::Decode {
            url: url.clone(),
            message: format!("expected a changeset ID, got '{}'", body.trim()),
        })?;
        log::info!("Created changeset with ID {}", changeset);
        Ok(changeset)
    }

    async fn close_changeset(
        &self,
        token: &str,
        changeset: ChangesetId,
    ) -> Result<(), OsmApiError> {
        let url = self.url(&format!("changeset/{}/close", changeset));
        self.send(reqwest::Method::PUT, &url, Some(token), None)
            .await?;
        log::info!("Closed changeset with ID {}", changeset);
        Ok(())
    }

    async fn write(&self, token: &str, path: &str, xml: String) -> Result<String, OsmApiError> {
        let url = self.url(path);
        log::debug!("PUT {} with {}", url, xml);
        self.send(reqwest::Method::PUT, &url, Some(token), Some(xml))
            .await
    }

    async fn fetch_element(
        &self,
        kind: ElementKind,
        id: ElementId,
    ) -> Result<Element, OsmApiError> {
        let url = self.url(&format!("{}/{}.json", kind, id));
        let body = match self.send(reqwest::Method::GET, &url, None, None).await {
            Err(OsmApiError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16()
                    || status == StatusCode::GONE.as_u16() =>
            {
                return Err(OsmApiError::NotFound { kind, id })
            }
            other => other?,
        };
        let response: ApiElementResponse =
            serde_json::from_str(&body).map_err(|err| OsmApiError::Decode {
                url: url.clone(),
                message: err.to_string(),
            })?;
        response
            .into_single(kind, id)
            .ok_or(OsmApiError::NotFound { kind, id })
    }

    async fn user_details(&self, token: &str) -> Result<UserDetails, OsmApiError> {
        let url = self.url("user/details.json");
        let body = self
            .send(reqwest::Method::GET, &url, Some(token), None)
            .await?;
        let response: UserDetailsResponse =
            serde_json::from_str(&body).map_err(|err| OsmApiError::Decode {
                url,
                message: err.to_string(),
            })?;
        Ok(response.user)
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::{get, put},
        Router,
    };

    use super::*;
    use crate::osm::payload::changeset_xml;

    async fn spawn_api(router: Router) -> HttpOsmApi {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        HttpOsmApi::new(
            &format!("http://{}/api/0.6/", addr),
            "osm_poi_editor-test",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn bearer(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn only_closed_changeset_conflicts_are_retryable() {
        let closed = OsmApiError::Status {
            method: "PUT".to_string(),
            url: "x".to_string(),
            status: 409,
            body: "The changeset 123 was closed at 2024-05-01 10:00:00 UTC".to_string(),
        };
        let version = OsmApiError::Status {
            method: "PUT".to_string(),
            url: "x".to_string(),
            status: 409,
            body: "Version mismatch: Provided 1, server had: 2 of Way 5".to_string(),
        };
        let other = OsmApiError::Status {
            method: "PUT".to_string(),
            url: "x".to_string(),
            status: 400,
            body: "The changeset is broken".to_string(),
        };
        assert!(closed.is_changeset_closed());
        assert!(!version.is_changeset_closed());
        assert!(!other.is_changeset_closed());
    }

    #[tokio::test]
    async fn creates_changeset_with_bearer_token() {
        let router = Router::new().route(
            "/api/0.6/changeset/create",
            put(|headers: HeaderMap, body: String| async move {
                assert_eq!(bearer(&headers), "Bearer secret-token");
                assert!(body.contains("<changeset>"));
                "4242\n"
            }),
        );
        let api = spawn_api(router).await;

        let id = api
            .create_changeset(
                "secret-token",
                changeset_xml("osm_poi_editor", "c").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(id, 4242);
    }

    #[tokio::test]
    async fn surfaces_conflict_body() {
        let router = Router::new().route(
            "/api/0.6/way/{id}",
            put(|| async {
                (
                    StatusCode::CONFLICT,
                    "The changeset 7 was closed at 2024-05-01 10:00:00 UTC",
                )
            }),
        );
        let api = spawn_api(router).await;

        let err = api
            .write("t", "way/5", "<osm/>".to_string())
            .await
            .unwrap_err();
        assert!(err.is_changeset_closed());
        assert_eq!(err.status(), Some(409));
    }

    #[tokio::test]
    async fn fetches_element_json() {
        let router = Router::new().route(
            "/api/0.6/node/{file}",
            get(|Path(file): Path<String>| async move {
                assert_eq!(file, "17.json");
                r#"{"version": "0.6", "elements": [
                    {"type": "node", "id": 17, "lat": 44.1, "lon": 26.2, "version": 3,
                     "changeset": 1, "user": "someone", "tags": {"amenity": "toilets"}}
                ]}"#
            }),
        );
        let api = spawn_api(router).await;

        match api.fetch_element(ElementKind::Node, 17).await.unwrap() {
            Element::Node(node) => {
                assert_eq!(node.version, Some(3));
                assert_eq!(node.tags["amenity"], "toilets");
            }
            other => panic!("expected a node, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_element_is_not_found() {
        let router = Router::new().route(
            "/api/0.6/way/{file}",
            get(|| async { (StatusCode::GONE, "") }),
        );
        let api = spawn_api(router).await;

        let err = api.fetch_element(ElementKind::Way, 3).await.unwrap_err();
        assert!(matches!(
            err,
            OsmApiError::NotFound {
                kind: ElementKind::Way,
                id: 3
            }
        ));
    }

    #[tokio::test]
    async fn reads_user_details() {
        let router = Router::new().route(
            "/api/0.6/user/details.json",
            get(|| async {
                r#"{"version": "0.6", "user": {"id": 1, "display_name": "mapper",
                    "account_created": "2020-01-01T00:00:00Z", "changesets": {"count": 12}}}"#
            }),
        );
        let api = spawn_api(router).await;

        let user = api.user_details("t").await.unwrap();
        assert_eq!(user.display_name, "mapper");
        assert_eq!(user.changesets, Some(ChangesetCount { count: 12 }));
    }
}
