use std::time::Instant;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::services::{ServeDir, ServeFile};

use super::handlers;
use super::state::SharedState;

/// Logs method, path, status and duration of every request. Query strings
/// are left out since the OAuth callback carries the authorization code there.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    log::info!(
        "{} {} -> {} in {:?}",
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

pub fn create_router(state: SharedState) -> Router {
    let static_dir = state.config.server.static_dir.clone();
    let index_file = static_dir.join(&state.config.server.index_file);

    Router::new()
        .route_service("/", ServeFile::new(index_file))
        .nest_service("/static", ServeDir::new(static_dir))
        .route("/data", get(handlers::all_layers))
        .route("/data/{layer}", get(handlers::layer_data))
        .route("/login", get(handlers::login))
        .route("/callback", get(handlers::callback))
        .route("/logout", get(handlers::logout))
        .route("/me", get(handlers::me))
        .route("/addnode", post(handlers::add_node))
        .route("/node/{id}", get(handlers::get_node))
        .route("/updateNode/{id}", post(handlers::update_node))
        .route("/addway", post(handlers::add_way))
        .route("/updateway", post(handlers::update_way))
        .route(
            "/pendingchanges",
            get(handlers::list_pending).post(handlers::queue_pending),
        )
        .route("/savechanges", post(handlers::save_changes))
        .route("/changeset/close", post(handlers::close_changeset))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}
