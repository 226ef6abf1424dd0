use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::graph::{lineage_graph, GraphFormat, DEFAULT_DEPTH};
use crate::ingest::{EnqueueError, Orchestrator};
use crate::models::{JobStatus, ScanJob};
use crate::resolver::resolve_sql;
use crate::store::{CatalogStore, StoreError};
use crate::visibility::{RoleVisibility, ROLES_HEADER};

pub const DEFAULT_JOB_LIMIT: i64 = 200;
pub const MAX_JOB_LIMIT: i64 = 500;

/// Shared handler state.
pub struct AppState<S> {
    pub store: Arc<S>,
    pub orchestrator: Orchestrator<S>,
}

impl<S: CatalogStore> AppState<S> {
    pub fn new(store: Arc<S>, orchestrator: Orchestrator<S>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }
}

/// Error response model
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error("blocking task failed: {0}")]
    Blocking(#[from] actix_web::error::BlockingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) | ApiError::Enqueue(_) | ApiError::Blocking(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        HttpResponse::build(status).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

/// Request model for a scan trigger
#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: i32,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: i32,
    pub source: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub idempotency_key: Option<String>,
    pub last_seen_at: Option<NaiveDateTime>,
}

impl From<ScanJob> for JobResponse {
    fn from(job: ScanJob) -> Self {
        Self {
            id: job.id,
            source: job.source,
            status: job.status,
            attempts: job.attempts,
            idempotency_key: job.idempotency_key,
            last_seen_at: job.last_seen_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub source: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQuery {
    pub asset_id: Option<i32>,
    pub depth: Option<i64>,
    pub format: Option<GraphFormat>,
}

#[derive(Debug, Deserialize)]
pub struct SqlQuery {
    pub persist: Option<i64>,
}

/// Request model for SQL lineage extraction
#[derive(Debug, Deserialize)]
pub struct SqlRequest {
    pub sql: String,
}

/// Handler for `POST /ingest/{source}/scan`
pub async fn enqueue_scan<S: CatalogStore>(
    state: web::Data<AppState<S>>,
    source: web::Path<String>,
    body: Option<web::Json<ScanRequest>>,
) -> Result<HttpResponse, ApiError> {
    let source = source.into_inner();
    let key = body.and_then(|b| b.into_inner().idempotency_key);
    tracing::info!("Scan requested for source={} key={:?}", source, key);

    let job_id = web::block(move || state.orchestrator.enqueue(&source, key.as_deref())).await??;

    Ok(HttpResponse::Accepted().json(EnqueueResponse {
        job_id,
        status: "enqueued".to_string(),
    }))
}

/// Handler for `GET /ingest/jobs/{id}`
pub async fn get_job<S: CatalogStore>(
    state: web::Data<AppState<S>>,
    id: web::Path<i32>,
) -> Result<HttpResponse, ApiError> {
    let id = id.into_inner();
    let job = web::block(move || state.orchestrator.get_job(id))
        .await??
        .ok_or_else(|| ApiError::NotFound(format!("scan job {}", id)))?;
    Ok(HttpResponse::Ok().json(JobResponse::from(job)))
}

/// Handler for `GET /ingest/jobs`
pub async fn list_jobs<S: CatalogStore>(
    state: web::Data<AppState<S>>,
    query: web::Query<ListJobsQuery>,
) -> Result<HttpResponse, ApiError> {
    let ListJobsQuery {
        source,
        limit,
        offset,
    } = query.into_inner();
    let limit = limit.unwrap_or(DEFAULT_JOB_LIMIT);
    let offset = offset.unwrap_or(0);
    if !(1..=MAX_JOB_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_JOB_LIMIT
        )));
    }
    if offset < 0 {
        return Err(ApiError::BadRequest("offset must not be negative".to_string()));
    }

    let jobs = web::block(move || state.orchestrator.list_jobs(source.as_deref(), limit, offset))
        .await??;
    let body: Vec<JobResponse> = jobs.into_iter().map(JobResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

/// Handler for `GET /lineage/graph`
pub async fn get_lineage_graph<S: CatalogStore>(
    state: web::Data<AppState<S>>,
    req: HttpRequest,
    query: web::Query<GraphQuery>,
) -> Result<HttpResponse, ApiError> {
    let GraphQuery {
        asset_id,
        depth,
        format,
    } = query.into_inner();
    let depth = depth
        .map(|d| u32::try_from(d.max(0)).unwrap_or(u32::MAX))
        .unwrap_or(DEFAULT_DEPTH);
    let format = format.unwrap_or_default();
    let visibility = RoleVisibility::from_header(
        req.headers()
            .get(ROLES_HEADER)
            .and_then(|v| v.to_str().ok()),
    );

    let view = web::block(move || {
        state
            .store
            .transaction(|conn| lineage_graph(conn, asset_id, depth, format, &visibility))
    })
    .await??;
    Ok(HttpResponse::Ok().json(view))
}

/// Handler for `POST /lineage/sql`
pub async fn lineage_from_sql<S: CatalogStore>(
    state: web::Data<AppState<S>>,
    query: web::Query<SqlQuery>,
    body: web::Json<SqlRequest>,
) -> Result<HttpResponse, ApiError> {
    let persist = match query.persist.unwrap_or(0) {
        0 => false,
        1 => true,
        other => {
            return Err(ApiError::BadRequest(format!(
                "persist must be 0 or 1, got {}",
                other
            )))
        }
    };
    let sql = body.into_inner().sql;

    let refs = web::block(move || resolve_sql(state.store.as_ref(), &sql, persist)).await?;
    Ok(HttpResponse::Ok().json(refs))
}

/// Health check handler
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("OK")
}
