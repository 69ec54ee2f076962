use std::time::Duration;

use thiserror::Error;

use super::bbox::BoundingBox;
use super::elements::{dedup_elements, Element, OverpassResponse};

/// Placeholder replaced by the requested bounding box in layer queries.
pub const BBOX_PLACEHOLDER: &str = "{{bbox}}";

#[derive(Error, Debug)]
pub enum OverpassError {
    #[error("request to Overpass failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Overpass answered with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not parse Overpass response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("query needs a bounding box but none was given")]
    MissingBoundingBox,
}

pub fn render_query(template: &str, bbox: Option<&BoundingBox>) -> Result<String, OverpassError> {
    if !template.contains(BBOX_PLACEHOLDER) {
        return Ok(template.to_string());
    }
    let bbox = bbox.ok_or(OverpassError::MissingBoundingBox)?;
    Ok(template.replace(BBOX_PLACEHOLDER, &bbox.to_string()))
}

pub struct OverpassClient {
    client: reqwest::Client,
    url: String,
}

impl OverpassClient {
    pub fn new(url: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Runs a query and returns its elements without duplicates.
    pub async fn fetch(&self, query: &str) -> Result<Vec<Element>, OverpassError> {
        log::debug!("Fetching data with query: {}", query);
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(query.to_string())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(OverpassError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OverpassResponse = serde_json::from_str(&body)?;
        if let Some(remark) = &parsed.remark {
            log::warn!("Overpass remark: {}", remark);
        }
        let fetched = parsed.elements.len();
        let elements = dedup_elements(parsed.elements);
        log::info!(
            "Fetched {} elements ({} after removing duplicates)",
            fetched,
            elements.len()
        );
        Ok(elements)
    }

    pub async fn fetch_template(
        &self,
        template: &str,
        bbox: Option<&BoundingBox>,
    ) -> Result<Vec<Element>, OverpassError> {
        let query = render_query(template, bbox)?;
        self.fetch(&query).await
    }
}
