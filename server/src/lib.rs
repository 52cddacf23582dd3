use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use quarry_core::{SearchEngine, SearchResult, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    50
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<SearchResult>,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SearchEngine>,
}

pub fn build_app(store_dir: &str) -> Result<Router> {
    let store = Store::open(store_dir)?;
    build_app_with_store(store)
}

pub fn build_app_with_store(store: Store) -> Result<Router> {
    let state = AppState {
        engine: Arc::new(SearchEngine::new(store)),
    };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", get(search_handler))
        .route("/doc/:doc_id", get(doc_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    let start = std::time::Instant::now();
    let k = params.k.clamp(1, 100);
    // Empty or unresolvable queries come back as empty result lists; only
    // an unavailable index store is an error.
    let results = state
        .engine
        .search_top(&params.q, k)
        .map_err(internal_error)?;
    Ok(Json(SearchResponse {
        query: params.q,
        took_s: start.elapsed().as_secs_f64(),
        total_hits: results.len(),
        results,
    }))
}

pub async fn doc_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<u64>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let store = state.engine.store();
    let Some(doc) = store.document(doc_id).map_err(internal_error)? else {
        return Ok(Json(serde_json::json!({ "error": "not found" })));
    };
    let mut children = Vec::new();
    for child in store.children(doc_id).map_err(internal_error)? {
        if let Some(c) = store.document(child).map_err(internal_error)? {
            children.push(serde_json::json!({ "title": c.title, "url": c.url }));
        }
    }
    Ok(Json(serde_json::json!({
        "doc_id": doc.id,
        "url": doc.url,
        "title": doc.title,
        "size": doc.size,
        "last_modified": doc.last_modified,
        "children": children,
    })))
}

fn internal_error(err: anyhow::Error) -> (StatusCode, String) {
    tracing::error!(error = %err, "index store error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "index store unavailable".to_string(),
    )
}
