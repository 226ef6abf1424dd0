use actix_web::{middleware, web, App, HttpServer};
use std::io;

use crate::handlers::{
    enqueue_scan, get_job, get_lineage_graph, health_check, lineage_from_sql, list_jobs, ApiError,
    AppState,
};
use crate::store::CatalogStore;

/// Registers routes and extractor error handling.
pub fn configure_app<S: CatalogStore>(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .app_data(
        web::PathConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .route("/health", web::get().to(health_check))
    .route("/ingest/{source}/scan", web::post().to(enqueue_scan::<S>))
    .route("/ingest/jobs", web::get().to(list_jobs::<S>))
    .route("/ingest/jobs/{id}", web::get().to(get_job::<S>))
    .route("/lineage/graph", web::get().to(get_lineage_graph::<S>))
    .route("/lineage/sql", web::post().to(lineage_from_sql::<S>));
}

/// Start the HTTP server
pub async fn start_server<S: CatalogStore>(
    host: &str,
    port: u16,
    workers: usize,
    state: AppState<S>,
) -> io::Result<()> {
    let bind_addr = format!("{}:{}", host, port);

    log::info!("Starting server on {} with {} workers", bind_addr, workers);

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .configure(configure_app::<S>)
    })
    .workers(workers)
    .bind(&bind_addr)?
    .run()
    .await
}
