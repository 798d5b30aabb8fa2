//! HTTP route handlers.

use crate::error::AppError;
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use srake_core::export::ExportFormat;
use srake_core::search::{SearchFilters, SearchHit, SearchMode, SearchOptions};
use srake_core::RecordKind;

// ---------------------------------------------------------------------------
// GET /api/v1/search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SearchParams {
    query: String,
    limit: Option<i64>,
    offset: Option<i64>,
    organism: Option<String>,
    platform: Option<String>,
    library_strategy: Option<String>,
    search_mode: Option<SearchMode>,
    similarity_threshold: Option<f32>,
    min_score: Option<f32>,
    #[serde(default)]
    show_confidence: bool,
}

#[derive(Serialize)]
pub struct SearchResponse {
    results: Vec<serde_json::Value>,
    total: u64,
    offset: usize,
    limit: usize,
}

fn render_hit(hit: &SearchHit, show_confidence: bool) -> serde_json::Value {
    let mut value = serde_json::to_value(hit).unwrap_or_default();
    if !show_confidence {
        if let Some(map) = value.as_object_mut() {
            map.remove("confidence");
        }
    }
    value
}

pub async fn search(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    if params.query.len() > state.config.http.max_query_len {
        return Err(AppError::bad_request(format!(
            "query exceeds {} characters",
            state.config.http.max_query_len
        )));
    }

    let max_limit = state.config.http.max_limit;
    let limit = params
        .limit
        .map(|l| (l.max(0) as usize).min(max_limit))
        .unwrap_or(state.config.search.default_limit);
    let offset = params.offset.map(|o| o.max(0) as usize).unwrap_or(0);

    let options = SearchOptions {
        limit: Some(limit),
        offset,
        mode: params.search_mode.unwrap_or_default(),
        filters: SearchFilters {
            organism: params.organism.clone(),
            platform: params.platform.clone(),
            library_strategy: params.library_strategy.clone(),
        },
        hybrid_weight: None,
        similarity_threshold: params.similarity_threshold,
        min_score: params.min_score,
        top_percentile: None,
    };

    let query = params.query.clone();
    let show_confidence = params.show_confidence;
    let result = tokio::task::spawn_blocking(move || {
        let store = state.open_store()?;
        state.router.search(&store, &query, &options)
    })
    .await
    .map_err(|e| AppError::bad_request(e.to_string()))??;

    Ok(Json(SearchResponse {
        results: result
            .hits
            .iter()
            .map(|h| render_hit(h, show_confidence))
            .collect(),
        total: result.total_hits,
        offset,
        limit,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/{studies,experiments,samples,runs}/{accession}
// ---------------------------------------------------------------------------

pub async fn get_study(
    state: State<SharedState>,
    accession: Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    get_entity(state, RecordKind::Study, accession.0).await
}

pub async fn get_experiment(
    state: State<SharedState>,
    accession: Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    get_entity(state, RecordKind::Experiment, accession.0).await
}

pub async fn get_sample(
    state: State<SharedState>,
    accession: Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    get_entity(state, RecordKind::Sample, accession.0).await
}

pub async fn get_run(
    state: State<SharedState>,
    accession: Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    get_entity(state, RecordKind::Run, accession.0).await
}

async fn get_entity(
    State(state): State<SharedState>,
    kind: RecordKind,
    accession: String,
) -> Result<Json<serde_json::Value>, AppError> {
    let entity = tokio::task::spawn_blocking(move || {
        let store = state.open_store()?;
        srake_core::lookup::get_typed(&store, kind, &accession)
    })
    .await
    .map_err(|e| AppError::bad_request(e.to_string()))??;

    match entity {
        Some(entity) => Ok(Json(serde_json::to_value(&entity).unwrap_or_default())),
        None => Err(AppError::not_found("no entity with that accession")),
    }
}

// ---------------------------------------------------------------------------
// GET /api/v1/stats
// ---------------------------------------------------------------------------

pub async fn stats(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, AppError> {
    let counts = tokio::task::spawn_blocking(move || {
        let store = state.open_store()?;
        store.counts()
    })
    .await
    .map_err(|e| AppError::bad_request(e.to_string()))??;
    Ok(Json(serde_json::to_value(counts).unwrap_or_default()))
}

// ---------------------------------------------------------------------------
// GET /api/v1/aggregations/{field}
// ---------------------------------------------------------------------------

pub async fn aggregations(
    State(state): State<SharedState>,
    Path(field): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let field_name = field.clone();
    let values = tokio::task::spawn_blocking(move || {
        let store = state.open_store()?;
        srake_core::lookup::aggregate(&store, &field_name, 20)
    })
    .await
    .map_err(|e| AppError::bad_request(e.to_string()))??;

    Ok(Json(serde_json::json!({ "field": field, "values": values })))
}

// ---------------------------------------------------------------------------
// POST /api/v1/export
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ExportRequest {
    query: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    filters: SearchFilters,
}

pub async fn export(
    State(state): State<SharedState>,
    Json(req): Json<ExportRequest>,
) -> Result<Response, AppError> {
    let format = ExportFormat::parse(req.format.as_deref().unwrap_or("json"))
        .map_err(AppError::from)?;

    let body = tokio::task::spawn_blocking(move || -> srake_core::Result<Vec<u8>> {
        let store = state.open_store()?;
        let options = SearchOptions {
            limit: Some(state.config.http.max_limit),
            filters: req.filters,
            ..Default::default()
        };
        let result = state.router.search(&store, &req.query, &options)?;
        let accessions: Vec<String> = result.hits.into_iter().map(|h| h.id).collect();
        let mut out = Vec::new();
        srake_core::export::export_accessions(&store, &accessions, format, &mut out)?;
        Ok(out)
    })
    .await
    .map_err(|e| AppError::bad_request(e.to_string()))??;

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"srake-export\"".to_string(),
            ),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// GET /api/v1/health
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let database = match state.open_store().and_then(|s| s.ping()) {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    let search_index = if state.router.index().is_open() {
        "open"
    } else {
        "closed"
    };
    let status = if database == "ok" { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "database": database,
        "search_index": search_index,
    }))
}
