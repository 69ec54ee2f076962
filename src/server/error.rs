use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::osm::api::OsmApiError;
use crate::osm::bbox::BoundingBoxError;
use crate::osm::changeset::ChangesetError;
use crate::osm::overpass::OverpassError;
use crate::osm::payload::EditError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn not_authenticated(action: &str) -> Self {
        AppError::Unauthorized(format!(
            "You are not authenticated. Please log in to {}.",
            action
        ))
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{}", self);
        }
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));
        (status, body).into_response()
    }
}

impl From<BoundingBoxError> for AppError {
    fn from(err: BoundingBoxError) -> Self {
        AppError::BadRequest(format!("Invalid bounding box: {}", err))
    }
}

impl From<EditError> for AppError {
    fn from(err: EditError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<OverpassError> for AppError {
    fn from(err: OverpassError) -> Self {
        match err {
            OverpassError::MissingBoundingBox => {
                AppError::BadRequest("Bounding box is required".to_string())
            }
            other => AppError::Upstream(format!("Failed to fetch data from Overpass: {}", other)),
        }
    }
}

impl From<OsmApiError> for AppError {
    fn from(err: OsmApiError) -> Self {
        match err.status() {
            Some(404) | Some(410) => AppError::NotFound(err.to_string()),
            Some(401) | Some(403) => AppError::Unauthorized(format!(
                "OpenStreetMap refused the request, please log in again: {}",
                err
            )),
            Some(409) => AppError::Conflict(err.to_string()),
            _ => AppError::Upstream(err.to_string()),
        }
    }
}

impl From<ChangesetError> for AppError {
    fn from(err: ChangesetError) -> Self {
        match err {
            ChangesetError::Api(err) => err.into(),
            ChangesetError::Invalid(err) => err.into(),
            ChangesetError::Payload(err) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenEndpoint { status, .. } if status < 500 => {
                AppError::Unauthorized(format!("Login failed: {}", err))
            }
            AuthError::Session(_) => AppError::Unauthorized(err.to_string()),
            other => AppError::Upstream(format!("Login failed: {}", other)),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::osm::elements::ElementKind;

    fn api_status(status: u16, body: &str) -> OsmApiError {
        OsmApiError::Status {
            method: "PUT".to_string(),
            url: "https://api.example/way/1".to_string(),
            status,
            body: body.to_string(),
        }
    }

    #[rstest]
    #[case(api_status(409, "Version mismatch"), StatusCode::CONFLICT)]
    #[case(api_status(401, "Unauthorized"), StatusCode::UNAUTHORIZED)]
    #[case(api_status(500, "boom"), StatusCode::BAD_GATEWAY)]
    #[case(api_status(410, "The way with the id 7 has already been deleted"), StatusCode::NOT_FOUND)]
    #[case(OsmApiError::NotFound { kind: ElementKind::Node, id: 5 }, StatusCode::NOT_FOUND)]
    fn osm_api_errors_map_to_statuses(#[case] err: OsmApiError, #[case] expected: StatusCode) {
        assert_eq!(AppError::from(err).status(), expected);
    }

    #[test]
    fn missing_bbox_is_a_bad_request() {
        let err = AppError::from(OverpassError::MissingBoundingBox);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Bounding box is required");
    }

    #[tokio::test]
    async fn renders_json_body() {
        let response = AppError::not_authenticated("add a new node").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body["error"],
            "You are not authenticated. Please log in to add a new node."
        );
        assert_eq!(body["status"], 401);
    }
}
