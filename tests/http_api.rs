use std::sync::Arc;
use std::time::Duration;

use actix_web::{http::StatusCode, test, web, App};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use catalog_lineage::config::ConnectorsConfig;
use catalog_lineage::connectors::ConnectorRegistry;
use catalog_lineage::handlers::AppState;
use catalog_lineage::ingest::{InlineSubmitter, Orchestrator, RetryPolicy, ScanRunner};
use catalog_lineage::server::configure_app;
use catalog_lineage::store::{CatalogStore, MemoryStore};

fn state() -> (Arc<MemoryStore>, web::Data<AppState<MemoryStore>>) {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ConnectorRegistry::from_config(&ConnectorsConfig::default()));
    let runner = Arc::new(ScanRunner::new(store.clone(), registry));
    let policy = RetryPolicy {
        max_retries: 0,
        delay: Duration::ZERO,
    };
    let orchestrator = Orchestrator::new(store.clone(), Arc::new(InlineSubmitter::new(runner, policy)));
    (store.clone(), web::Data::new(AppState::new(store, orchestrator)))
}

macro_rules! app {
    ($data:expr) => {
        test::init_service(
            App::new()
                .app_data($data.clone())
                .configure(configure_app::<MemoryStore>),
        )
        .await
    };
}

#[actix_web::test]
async fn health_returns_ok() {
    let (_, data) = state();
    let app = app!(data);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(test::read_body(resp).await, "OK");
}

#[actix_web::test]
async fn scan_is_accepted_and_job_is_queryable() {
    let (store, data) = state();
    let app = app!(data);

    let req = test::TestRequest::post()
        .uri("/ingest/postgres/scan")
        .set_json(json!({"idempotency_key": "nightly"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], json!("enqueued"));
    let job_id = body["job_id"].as_i64().unwrap();

    // Same key reuses the job.
    let again: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::post()
            .uri("/ingest/postgres/scan")
            .set_json(json!({"idempotency_key": "nightly"}))
            .to_request(),
    )
    .await;
    assert_eq!(again["job_id"].as_i64(), Some(job_id));

    let job: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri(&format!("/ingest/jobs/{}", job_id))
            .to_request(),
    )
    .await;
    assert_eq!(job["source"], json!("postgres"));
    assert_eq!(job["status"], json!("success"));
    assert_eq!(job["attempts"], json!(2));
    assert_eq!(job["idempotency_key"], json!("nightly"));

    let snap = store.snapshot().unwrap();
    assert_eq!(snap.assets().len(), 1);
    assert_eq!(snap.assets()[0].name, "public.table");
    assert_eq!(snap.assets()[0].column_names.as_deref(), Some("id"));
}

#[actix_web::test]
async fn scan_without_body_is_accepted() {
    let (_, data) = state();
    let app = app!(data);
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/ingest/s3/scan").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
}

#[actix_web::test]
async fn missing_job_is_404() {
    let (_, data) = state();
    let app = app!(data);
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/ingest/jobs/4242").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[actix_web::test]
async fn job_listing_validates_paging() {
    let (_, data) = state();
    let app = app!(data);
    for source in ["s3", "snowflake", "s3"] {
        test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/ingest/{}/scan", source))
                .to_request(),
        )
        .await;
    }

    let jobs: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/ingest/jobs?source=s3").to_request(),
    )
    .await;
    assert_eq!(jobs.as_array().unwrap().len(), 2);

    let page: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri("/ingest/jobs?limit=1&offset=1")
            .to_request(),
    )
    .await;
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["source"], json!("snowflake"));

    for uri in [
        "/ingest/jobs?limit=0",
        "/ingest/jobs?limit=501",
        "/ingest/jobs?offset=-1",
        "/ingest/jobs?limit=abc",
    ] {
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[actix_web::test]
async fn sql_lineage_persists_and_feeds_graph() {
    let (_, data) = state();
    let app = app!(data);

    // The s3 and postgres stubs land in different systems.
    for source in ["s3", "postgres"] {
        test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/ingest/{}/scan", source))
                .to_request(),
        )
        .await;
    }

    let refs: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::post()
            .uri("/lineage/sql?persist=1")
            .set_json(json!({"sql": "INSERT INTO public.\"table\" SELECT * FROM \"s3://bucket/prefix/\""}))
            .to_request(),
    )
    .await;
    assert_eq!(refs["targets"], json!(["public.table"]));
    assert_eq!(refs["sources"], json!(["public.table", "s3://bucket/prefix/"]));

    let graph: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/lineage/graph").to_request(),
    )
    .await;
    assert_eq!(graph["nodes"].as_array().unwrap().len(), 2);
    assert_eq!(graph["edges"].as_array().unwrap().len(), 1);

    let start = graph["edges"][0][1].as_i64().unwrap();
    let ui: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri(&format!("/lineage/graph?asset_id={}&depth=1&format=ui", start))
            .to_request(),
    )
    .await;
    assert_eq!(ui["edges"][0]["target"].as_i64(), Some(start));
    assert!(ui["nodes"][0]["name"].is_string());
}

#[actix_web::test]
async fn sql_lineage_rejects_bad_persist_flag() {
    let (_, data) = state();
    let app = app!(data);
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/lineage/sql?persist=2")
            .set_json(json!({"sql": "SELECT 1"}))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn unparseable_sql_returns_empty_lists() {
    let (_, data) = state();
    let app = app!(data);
    let body: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::post()
            .uri("/lineage/sql")
            .set_json(json!({"sql": "this is not sql"}))
            .to_request(),
    )
    .await;
    assert_eq!(body, json!({"sources": [], "targets": []}));
}

#[actix_web::test]
async fn graph_respects_role_header() {
    let (store, data) = state();
    let app = app!(data);
    test::call_service(
        &app,
        test::TestRequest::post().uri("/ingest/postgres/scan").to_request(),
    )
    .await;
    let asset_id = store.snapshot().unwrap().assets()[0].id;
    store
        .transaction(|conn| conn.set_asset_visibility(asset_id, Some("finance")))
        .unwrap();

    let hidden: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri(&format!("/lineage/graph?asset_id={}", asset_id))
            .insert_header(("X-User-Roles", "marketing"))
            .to_request(),
    )
    .await;
    assert_eq!(hidden, json!({"nodes": [], "edges": []}));

    let shown: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri(&format!("/lineage/graph?asset_id={}", asset_id))
            .insert_header(("X-User-Roles", "finance"))
            .to_request(),
    )
    .await;
    assert_eq!(shown, json!({"nodes": [asset_id], "edges": []}));
}
