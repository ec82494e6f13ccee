//
// web.rs
// Pacs-Bridge-rs
//
// Axum-based HTTP server exposing PACS listing, verification, queries, WADO-RS proxying and retrieval tracking.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::attributes::Attributes;
use crate::dicomweb::RenderedMediaType;
use crate::error::PacsError;
use crate::models::{EchoResult, PacsConfig, RetrievalProgress};
use crate::progress::RetrievalId;
use crate::query::{MoveScope, QueryFilters};
use crate::router::{DicomWebBackend, LegacyBackend, PacsRouter};

struct AppState<L: LegacyBackend, W: DicomWebBackend> {
    router: Arc<PacsRouter<L, W>>,
}

impl<L: LegacyBackend, W: DicomWebBackend> Clone for AppState<L, W> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Builds the API routes around a shared router.
pub fn app<L, W>(router: Arc<PacsRouter<L, W>>) -> Router
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let state = AppState { router };

    Router::new()
        .route("/api/pacs", get(list_pacs::<L, W>))
        .route("/api/pacs/:id/echo", post(echo_handler::<L, W>))
        .route("/api/pacs/:id/studies", get(studies_handler::<L, W>))
        .route("/api/pacs/:id/studies/:study/series", get(series_handler::<L, W>))
        .route(
            "/api/pacs/:id/studies/:study/series/:series/instances",
            get(instances_handler::<L, W>),
        )
        .route(
            "/api/pacs/:id/studies/:study/series/:series/instances/:instance",
            get(wado_handler::<L, W>),
        )
        .route("/api/pacs/:id/studies/:study/retrieve", post(retrieve_handler::<L, W>))
        .route("/api/retrievals", get(list_retrievals::<L, W>))
        .route(
            "/api/retrievals/:rid",
            get(retrieval_handler::<L, W>).delete(cancel_handler::<L, W>),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bootstraps the Axum HTTP server.
pub async fn start_server<L, W>(router: Arc<PacsRouter<L, W>>, host: &str, port: u16) -> anyhow::Result<()>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    // Finished jobs stay visible to pollers for an hour.
    let tracker = router.tracker().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            let pruned = tracker.prune_finished(chrono::Duration::hours(1));
            if pruned > 0 {
                debug!("Pruned {} finished retrieval(s)", pruned);
            }
        }
    });

    info!("Server running at http://{}", listener.local_addr()?);
    axum::serve(listener, app(router)).await?;
    Ok(())
}

/// Runs a blocking router call on the blocking pool.
async fn blocking<L, W, T, F>(state: &AppState<L, W>, call: F) -> ApiResult<T>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
    T: Send + 'static,
    F: FnOnce(&PacsRouter<L, W>) -> crate::error::Result<T> + Send + 'static,
{
    let router = state.router.clone();
    tokio::task::spawn_blocking(move || call(&router))
        .await
        .map_err(internal_error)?
        .map_err(api_error)
}

async fn list_pacs<L, W>(State(state): State<AppState<L, W>>) -> Json<Vec<PacsConfig>>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    Json(state.router.list_pacs())
}

async fn echo_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path(id): Path<String>,
) -> ApiResult<Json<EchoResult>>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let result = blocking(&state, move |router| router.test_connection(&id)).await?;
    Ok(Json(result))
}

async fn studies_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path(id): Path<String>,
    Query(filters): Query<QueryFilters>,
) -> ApiResult<Json<Vec<Attributes>>>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let studies = blocking(&state, move |router| router.query_studies(&id, &filters)).await?;
    Ok(Json(studies))
}

async fn series_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path((id, study)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Attributes>>>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let series = blocking(&state, move |router| router.query_series(&id, &study)).await?;
    Ok(Json(series))
}

async fn instances_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path((id, study, series)): Path<(String, String, String)>,
) -> ApiResult<Json<Vec<Attributes>>>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let instances = blocking(&state, move |router| router.query_instances(&id, &study, &series)).await?;
    Ok(Json(instances))
}

#[derive(Debug, Default, Deserialize)]
struct WadoQuery {
    rendered: Option<RenderedMediaType>,
}

async fn wado_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path((id, study, series, instance)): Path<(String, String, String, String)>,
    Query(query): Query<WadoQuery>,
) -> ApiResult<impl IntoResponse>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let content_type = query
        .rendered
        .map(|media| media.mime())
        .unwrap_or("application/dicom");
    let bytes = blocking(&state, move |router| match query.rendered {
        Some(media) => router.fetch_rendered(&id, &study, &series, &instance, media),
        None => router.fetch_instance(&id, &study, &series, &instance),
    })
    .await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

#[derive(Debug, Default, Deserialize)]
struct RetrieveRequest {
    destination_ae: Option<String>,
    series_instance_uid: Option<String>,
    sop_instance_uid: Option<String>,
}

async fn retrieve_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path((id, study)): Path<(String, String)>,
    body: Option<Json<RetrieveRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let scope = match (request.series_instance_uid, request.sop_instance_uid) {
        (Some(series), Some(instance)) => MoveScope::image(study, series, instance),
        (Some(series), None) => MoveScope::series(study, series),
        (None, Some(_)) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "sop_instance_uid requires series_instance_uid".to_string(),
            ))
        }
        (None, None) => MoveScope::study(study),
    };

    // Validation is synchronous so usage errors come back before the 202.
    let ticket = state
        .router
        .begin_retrieval(&id, scope, request.destination_ae.as_deref())
        .map_err(api_error)?;
    let retrieval_id = ticket.id();

    let router = state.router.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = router.run_retrieval(ticket) {
            error!("Retrieval {} could not run: {}", retrieval_id, e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "retrieval_id": retrieval_id,
            "status_url": format!("/api/retrievals/{}", retrieval_id)
        })),
    ))
}

/// Progress snapshot plus the derived fields pollers display.
#[derive(Debug, Serialize)]
struct ProgressView {
    #[serde(flatten)]
    progress: RetrievalProgress,
    percent_complete: u32,
    remaining: u32,
}

impl From<RetrievalProgress> for ProgressView {
    fn from(progress: RetrievalProgress) -> Self {
        Self {
            percent_complete: progress.percent_complete(),
            remaining: progress.remaining(),
            progress,
        }
    }
}

async fn list_retrievals<L, W>(State(state): State<AppState<L, W>>) -> Json<Vec<ProgressView>>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    Json(
        state
            .router
            .tracker()
            .list()
            .into_iter()
            .map(ProgressView::from)
            .collect(),
    )
}

async fn retrieval_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path(rid): Path<String>,
) -> ApiResult<Json<ProgressView>>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let id: RetrievalId = rid.parse().map_err(api_error)?;
    let progress = state.router.tracker().snapshot(&id).map_err(api_error)?;
    Ok(Json(progress.into()))
}

async fn cancel_handler<L, W>(
    State(state): State<AppState<L, W>>,
    Path(rid): Path<String>,
) -> ApiResult<(StatusCode, Json<ProgressView>)>
where
    L: LegacyBackend + 'static,
    W: DicomWebBackend + 'static,
{
    let id: RetrievalId = rid.parse().map_err(api_error)?;
    let progress = state.router.tracker().cancel(&id).map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(progress.into())))
}

fn api_error(err: PacsError) -> (StatusCode, String) {
    let status = match &err {
        PacsError::UnknownPacs(_) | PacsError::UnknownRetrieval(_) => StatusCode::NOT_FOUND,
        PacsError::RetrievalFinalized(_) => StatusCode::CONFLICT,
        e if e.is_configuration() => StatusCode::BAD_REQUEST,
        e if e.is_connection() => StatusCode::BAD_GATEWAY,
        PacsError::Transport(_) | PacsError::Http { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn internal_error<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_http_statuses() {
        assert_eq!(api_error(PacsError::UnknownPacs("x".into())).0, StatusCode::NOT_FOUND);
        assert_eq!(api_error(PacsError::Unsupported("move".into())).0, StatusCode::BAD_REQUEST);
        assert_eq!(api_error(PacsError::transport("reset")).0, StatusCode::BAD_GATEWAY);
        assert_eq!(
            api_error(PacsError::Http {
                status: 503,
                url: "http://pacs".into()
            })
            .0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            api_error(PacsError::RetrievalFinalized("r".into())).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            api_error(PacsError::protocol("bad")).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
