use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{cookie_value, SessionClaims, SESSION_COOKIE, STATE_COOKIE};
use crate::osm::api::UserDetails;
use crate::osm::bbox::BoundingBox;
use crate::osm::changeset::EditOutcome;
use crate::osm::conversion::elements_to_feature_collection;
use crate::osm::elements::{Element, ElementId, ElementKind, Node, Tags, Way};
use crate::osm::payload::{validate_tags, ChangesetId, EditRequest};

use super::error::{AppError, AppResult};
use super::extract::{AppJson, AppPath, AppQuery};
use super::pending::PendingEdit;
use super::state::{AppState, SharedState};

#[derive(Deserialize, Debug, Default)]
pub struct BboxParams {
    pub bbox: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Json,
    Geojson,
}

#[derive(Deserialize, Debug, Default)]
pub struct LayerParams {
    pub bbox: Option<String>,
    #[serde(default)]
    pub format: DataFormat,
}

#[derive(Deserialize, Debug)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct NewNode {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Deserialize, Debug)]
pub struct NewWay {
    pub nodes: Vec<ElementId>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Deserialize, Debug)]
pub struct WayTags {
    pub id: ElementId,
    pub tags: Tags,
}

/// Answer to every successful element write.
#[derive(Serialize, Debug, PartialEq)]
pub struct WriteResponse {
    pub message: String,
    pub id: ElementId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub changeset: ChangesetId,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct QueueResponse {
    pub message: String,
    pub pending: usize,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct SaveResponse {
    pub message: String,
    pub saved: usize,
    pub remaining: usize,
    pub changeset: Option<ChangesetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct CloseResponse {
    pub message: String,
    pub changeset: Option<ChangesetId>,
}

fn parse_bbox(raw: Option<&str>) -> AppResult<Option<BoundingBox>> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => Ok(Some(raw.parse()?)),
        None => Ok(None),
    }
}

fn require_session(state: &AppState, headers: &HeaderMap, action: &str) -> AppResult<SessionClaims> {
    state.sessions.read_session(headers).ok_or_else(|| {
        log::info!("Rejected unauthenticated request to {}", action);
        AppError::not_authenticated(action)
    })
}

fn current_version(kind: ElementKind, id: ElementId, version: Option<u64>) -> AppResult<u64> {
    version.ok_or_else(|| {
        AppError::Upstream(format!("OpenStreetMap returned {} {} without a version", kind, id))
    })
}

async fn current_node(state: &AppState, id: ElementId) -> AppResult<Node> {
    match state.osm.fetch_element(ElementKind::Node, id).await? {
        Element::Node(node) => Ok(node),
        other => Err(AppError::Upstream(format!(
            "Expected node {} but OpenStreetMap returned {} {}",
            id,
            other.kind(),
            other.id()
        ))),
    }
}

async fn current_way(state: &AppState, id: ElementId) -> AppResult<Way> {
    match state.osm.fetch_element(ElementKind::Way, id).await? {
        Element::Way(way) => Ok(way),
        other => Err(AppError::Upstream(format!(
            "Expected way {} but OpenStreetMap returned {} {}",
            id,
            other.kind(),
            other.id()
        ))),
    }
}

fn created(kind: ElementKind, outcome: EditOutcome) -> AppResult<Json<WriteResponse>> {
    let id: ElementId = outcome.response.parse().map_err(|_| {
        AppError::Upstream(format!(
            "OpenStreetMap answered '{}' instead of a new {} ID",
            outcome.response, kind
        ))
    })?;
    log::info!("Created {} {} in changeset {}", kind, id, outcome.changeset);
    Ok(Json(WriteResponse {
        message: format!("Created {} {}", kind, id),
        id,
        version: None,
        changeset: outcome.changeset,
    }))
}

fn updated(kind: ElementKind, id: ElementId, outcome: EditOutcome) -> Json<WriteResponse> {
    let version = outcome.response.parse().ok();
    log::info!("Updated {} {} in changeset {}", kind, id, outcome.changeset);
    Json(WriteResponse {
        message: format!("Updated {} {}", kind, id),
        id,
        version,
        changeset: outcome.changeset,
    })
}

/// Every layer, keyed by name.
pub async fn all_layers(
    State(state): State<SharedState>,
    AppQuery(params): AppQuery<BboxParams>,
) -> AppResult<Json<BTreeMap<String, Vec<Element>>>> {
    let bbox = parse_bbox(params.bbox.as_deref())?;
    if bbox.is_none() && state.config.has_on_demand_layers() {
        return Err(AppError::BadRequest("Bounding box is required".to_string()));
    }
    let mut data = BTreeMap::new();
    for layer in state.layers.layers() {
        let elements = state
            .layers
            .elements(&state.overpass, layer, bbox.as_ref())
            .await?;
        data.insert(layer.name.clone(), Arc::unwrap_or_clone(elements));
    }
    Ok(Json(data))
}

pub async fn layer_data(
    State(state): State<SharedState>,
    AppPath(name): AppPath<String>,
    AppQuery(params): AppQuery<LayerParams>,
) -> AppResult<Response> {
    let layer = state
        .layers
        .get(&name)
        .ok_or_else(|| AppError::NotFound(format!("Layer '{}' does not exist", name)))?;
    let bbox = parse_bbox(params.bbox.as_deref())?;
    let elements = state
        .layers
        .elements(&state.overpass, layer, bbox.as_ref())
        .await?;
    Ok(match params.format {
        DataFormat::Json => Json(elements.as_slice()).into_response(),
        DataFormat::Geojson => Json(elements_to_feature_collection(&elements)).into_response(),
    })
}

pub async fn login(State(state): State<SharedState>) -> Response {
    let csrf_state = Uuid::new_v4().to_string();
    let url = state.oauth.authorize_url(&csrf_state);
    log::info!("Redirecting to OpenStreetMap for authorization");
    (
        [(header::SET_COOKIE, state.sessions.state_cookie(&csrf_state))],
        Redirect::temporary(&url),
    )
        .into_response()
}

pub async fn callback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    AppQuery(params): AppQuery<CallbackParams>,
) -> AppResult<Response> {
    if let Some(error) = params.error {
        return Err(AppError::BadRequest(format!(
            "Authorization was not granted: {}",
            error
        )));
    }
    let expected = cookie_value(&headers, STATE_COOKIE).filter(|value| !value.is_empty());
    match (expected, params.state.as_deref()) {
        (Some(expected), Some(received)) if expected == received => {}
        _ => {
            log::warn!("OAuth callback with a missing or mismatched state");
            return Err(AppError::BadRequest("Invalid OAuth state".to_string()));
        }
    }
    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::BadRequest("Authorization code is missing".to_string()))?;

    let token = state.oauth.exchange_code(&code).await?;
    let claims = state.sessions.claims_for(&token);
    let session_cookie = state.sessions.session_cookie(&claims)?;
    log::info!("Login completed, session valid until {}", claims.exp);
    Ok((
        AppendHeaders([
            (header::SET_COOKIE, session_cookie),
            (header::SET_COOKIE, state.sessions.clear_cookie(STATE_COOKIE)),
        ]),
        Redirect::to("/"),
    )
        .into_response())
}

/// Closes the caller's reused changeset, if any, and drops the session.
pub async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Some(session) = state.sessions.read_session(&headers) {
        match state.changesets.close(&session.access_token).await {
            Ok(Some(changeset)) => log::info!("Closed changeset {} on logout", changeset),
            Ok(None) => {}
            Err(err) => log::warn!("Could not close changeset on logout: {}", err),
        }
    }
    (
        [(header::SET_COOKIE, state.sessions.clear_cookie(SESSION_COOKIE))],
        Redirect::to("/"),
    )
        .into_response()
}

pub async fn me(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AppResult<Json<UserDetails>> {
    let session = require_session(&state, &headers, "see your account")?;
    Ok(Json(state.osm.user_details(&session.access_token).await?))
}

pub async fn add_node(
    State(state): State<SharedState>,
    headers: HeaderMap,
    AppJson(node): AppJson<NewNode>,
) -> AppResult<Json<WriteResponse>> {
    let session = require_session(&state, &headers, "add a new node")?;
    let edit = EditRequest::CreateNode {
        lat: node.lat,
        lon: node.lon,
        tags: node.tags,
    };
    let outcome = state.changesets.apply(&session.access_token, &edit).await?;
    created(ElementKind::Node, outcome)
}

pub async fn get_node(
    State(state): State<SharedState>,
    AppPath(id): AppPath<ElementId>,
) -> AppResult<Json<Node>> {
    Ok(Json(current_node(&state, id).await?))
}

/// Replaces the tags of a node, keeping its position.
pub async fn update_node(
    State(state): State<SharedState>,
    AppPath(id): AppPath<ElementId>,
    headers: HeaderMap,
    AppJson(tags): AppJson<Tags>,
) -> AppResult<Json<WriteResponse>> {
    let session = require_session(&state, &headers, "update this node")?;
    let node = current_node(&state, id).await?;
    let edit = EditRequest::UpdateNode {
        id,
        version: current_version(ElementKind::Node, id, node.version)?,
        lat: node.lat,
        lon: node.lon,
        tags,
    };
    let outcome = state.changesets.apply(&session.access_token, &edit).await?;
    Ok(updated(ElementKind::Node, id, outcome))
}

pub async fn add_way(
    State(state): State<SharedState>,
    headers: HeaderMap,
    AppJson(way): AppJson<NewWay>,
) -> AppResult<Json<WriteResponse>> {
    let session = require_session(&state, &headers, "add a new road")?;
    let edit = EditRequest::CreateWay {
        nodes: way.nodes,
        tags: way.tags,
    };
    let outcome = state.changesets.apply(&session.access_token, &edit).await?;
    created(ElementKind::Way, outcome)
}

/// Replaces the tags of a way, keeping its nodes.
pub async fn update_way(
    State(state): State<SharedState>,
    headers: HeaderMap,
    AppJson(update): AppJson<WayTags>,
) -> AppResult<Json<WriteResponse>> {
    let session = require_session(&state, &headers, "update this road")?;
    let way = current_way(&state, update.id).await?;
    let edit = EditRequest::UpdateWay {
        id: update.id,
        version: current_version(ElementKind::Way, update.id, way.version)?,
        nodes: way.nodes,
        tags: update.tags,
    };
    let outcome = state.changesets.apply(&session.access_token, &edit).await?;
    Ok(updated(ElementKind::Way, update.id, outcome))
}

pub async fn list_pending(State(state): State<SharedState>) -> Json<Vec<PendingEdit>> {
    Json(state.pending.snapshot())
}

pub async fn queue_pending(
    State(state): State<SharedState>,
    headers: HeaderMap,
    AppJson(edit): AppJson<PendingEdit>,
) -> AppResult<Json<QueueResponse>> {
    require_session(&state, &headers, "queue changes")?;
    validate_tags(&edit.tags)?;
    state.pending.queue(edit.id, edit.tags);
    Ok(Json(QueueResponse {
        message: format!("Queued changes for way {}", edit.id),
        pending: state.pending.len(),
    }))
}

async fn way_update(state: &AppState, edit: &PendingEdit) -> AppResult<EditRequest> {
    let way = current_way(state, edit.id).await?;
    Ok(EditRequest::UpdateWay {
        id: edit.id,
        version: current_version(ElementKind::Way, edit.id, way.version)?,
        nodes: way.nodes,
        tags: edit.tags.clone(),
    })
}

/// Writes all buffered way edits in one changeset.
///
/// Edits that were written are removed from the buffer unless they were
/// replaced meanwhile. Ways that no longer exist are dropped from the buffer;
/// ways that could not be read and edits after a failed write stay queued for
/// the next save.
pub async fn save_changes(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AppResult<Json<SaveResponse>> {
    let session = require_session(&state, &headers, "save changes")?;
    let _flush = state.flush_lock.lock().await;

    let pending = state.pending.snapshot();
    if pending.is_empty() {
        return Ok(Json(SaveResponse {
            message: "No pending changes to save".to_string(),
            saved: 0,
            remaining: 0,
            changeset: None,
            error: None,
        }));
    }
    log::info!("Saving {} pending changes", pending.len());

    let mut writable = Vec::with_capacity(pending.len());
    let mut edits = Vec::with_capacity(pending.len());
    let mut problems = Vec::new();
    for edit in &pending {
        match way_update(&state, edit).await {
            Ok(request) => {
                writable.push(edit);
                edits.push(request);
            }
            Err(AppError::NotFound(reason)) => {
                log::warn!("Dropping pending change of way {}: {}", edit.id, reason);
                state.pending.acknowledge(edit.id, &edit.tags);
                problems.push(format!("way {} was dropped: {}", edit.id, reason));
            }
            Err(err) => {
                log::warn!("Could not read way {}, keeping it queued: {}", edit.id, err);
                problems.push(format!("way {} is still queued: {}", edit.id, err));
            }
        }
    }

    let outcome = state
        .changesets
        .apply_batch(&session.access_token, &edits)
        .await?;
    for edit in writable.iter().take(outcome.completed.len()) {
        state.pending.acknowledge(edit.id, &edit.tags);
    }
    let saved = outcome.completed.len();
    let changeset = outcome
        .completed
        .last()
        .map(|done| done.changeset)
        .or(outcome.changeset);

    match outcome.error {
        Some(err) if saved == 0 => return Err(err.into()),
        Some(err) => problems.push(err.to_string()),
        None => {}
    }
    if problems.is_empty() {
        log::info!("All {} pending changes saved", saved);
        return Ok(Json(SaveResponse {
            message: format!("Saved {} changes", saved),
            saved,
            remaining: state.pending.len(),
            changeset,
            error: None,
        }));
    }
    Ok(Json(SaveResponse {
        message: format!("Saved {} of {} changes", saved, pending.len()),
        saved,
        remaining: state.pending.len(),
        changeset,
        error: Some(problems.join("; ")),
    }))
}

pub async fn close_changeset(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AppResult<Json<CloseResponse>> {
    let session = require_session(&state, &headers, "close your changeset")?;
    let closed = state.changesets.close(&session.access_token).await?;
    let message = match closed {
        Some(changeset) => format!("Closed changeset {}", changeset),
        None => "No open changeset".to_string(),
    };
    Ok(Json(CloseResponse {
        message,
        changeset: closed,
    }))
}
