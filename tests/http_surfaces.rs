//
// http_surfaces.rs
// Pacs-Bridge-rs
//
// Exercises the DICOMweb client against a local mock PACS and the REST API end to end over real sockets.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use pacs_bridge::attributes::Attributes;
use pacs_bridge::config::PacsRegistry;
use pacs_bridge::dicomweb::{DicomWebClient, RenderedMediaType};
use pacs_bridge::models::{
    DicomWebEndpoint, EchoResult, MoveResult, PacsConfig, QueryLevel, RemoteNode, RetrievalStatus,
    SubOperationCounts,
};
use pacs_bridge::progress::RetrievalHandle;
use pacs_bridge::query::{MoveScope, QueryFilters};
use pacs_bridge::scu::StoreOutcome;
use pacs_bridge::{web, LegacyBackend, PacsError, PacsRouter, Result};
use serde_json::{json, Value};

type AcceptLog = Arc<Mutex<Vec<String>>>;

/// Runs `app` on an ephemeral port in a background runtime.
fn serve(app: Router) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
            tx.send(listener.local_addr().expect("addr")).expect("send addr");
            axum::serve(listener, app).await.expect("serve");
        });
    });
    rx.recv().expect("server address")
}

fn record_accept(log: &AcceptLog, headers: &HeaderMap) {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    log.lock().unwrap().push(accept);
}

async fn mock_studies(
    State(log): State<AcceptLog>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    record_accept(&log, &headers);
    let patient = params.get("PatientID").cloned().unwrap_or_else(|| "ANY".into());
    (
        [(header::CONTENT_TYPE, "application/dicom+json")],
        Json(json!([
            {
                "00100020": { "vr": "LO", "Value": [patient] },
                "00100010": { "vr": "PN", "Value": [{ "Alphabetic": "Doe^Jane" }] },
                "0020000D": { "vr": "UI", "Value": ["1.2.3"] },
                "00201208": { "vr": "IS", "Value": [7] },
                "00081032": { "vr": "SQ", "Value": [{}] }
            }
        ])),
    )
}

async fn mock_series(
    State(log): State<AcceptLog>,
    headers: HeaderMap,
    UrlPath(study): UrlPath<String>,
) -> axum::response::Response {
    record_accept(&log, &headers);
    if study == "empty" {
        return StatusCode::NO_CONTENT.into_response();
    }
    Json(json!([
        { "0020000E": { "vr": "UI", "Value": [format!("{}.1", study)] }, "00080060": { "vr": "CS", "Value": ["CT"] } },
        { "0020000E": { "vr": "UI", "Value": [format!("{}.2", study)] }, "00080060": { "vr": "CS", "Value": ["SR"] } }
    ]))
    .into_response()
}

async fn mock_instances() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn mock_instance(State(log): State<AcceptLog>, headers: HeaderMap) -> impl IntoResponse {
    record_accept(&log, &headers);
    ([(header::CONTENT_TYPE, "application/dicom")], b"DICM-BYTES".to_vec())
}

async fn mock_rendered(State(log): State<AcceptLog>, headers: HeaderMap) -> impl IntoResponse {
    record_accept(&log, &headers);
    ([(header::CONTENT_TYPE, "image/png")], vec![0x89, b'P', b'N', b'G'])
}

/// A DICOMweb PACS rooted at `/dicom-web`.
fn mock_pacs() -> (SocketAddr, AcceptLog) {
    let log: AcceptLog = Arc::default();
    let app = Router::new()
        .route("/dicom-web/studies", get(mock_studies))
        .route("/dicom-web/studies/:study/series", get(mock_series))
        .route(
            "/dicom-web/studies/:study/series/:series/instances",
            get(mock_instances),
        )
        .route(
            "/dicom-web/studies/:study/series/:series/instances/:instance",
            get(mock_instance),
        )
        .route(
            "/dicom-web/studies/:study/series/:series/instances/:instance/rendered",
            get(mock_rendered),
        )
        .with_state(log.clone());
    (serve(app), log)
}

fn endpoint(addr: SocketAddr) -> DicomWebEndpoint {
    let base = format!("http://{}/dicom-web", addr);
    DicomWebEndpoint {
        qido_rs_url: Some(base.clone()),
        wado_rs_url: Some(base),
        timeout_ms: Some(5000),
        ..Default::default()
    }
}

#[test]
fn qido_queries_decode_dicom_json() {
    let (addr, accepts) = mock_pacs();
    let client = DicomWebClient::new().unwrap();
    let endpoint = endpoint(addr);

    let studies = client
        .query_studies(&endpoint, &QueryFilters::new().with("PatientID", "PAT9"))
        .unwrap();
    assert_eq!(studies.len(), 1);
    assert_eq!(studies[0].get_keyword("PatientID"), Some("PAT9"));
    assert_eq!(studies[0].get_keyword("PatientName"), Some("Doe^Jane"));
    assert_eq!(studies[0].get_keyword("NumberOfStudyRelatedInstances"), Some("7"));

    let series = client.query_series(&endpoint, "1.2.3").unwrap();
    let uids: Vec<&str> = series
        .iter()
        .filter_map(|s| s.get_keyword("SeriesInstanceUID"))
        .collect();
    assert_eq!(uids, vec!["1.2.3.1", "1.2.3.2"]);

    let log = accepts.lock().unwrap();
    assert!(log.iter().all(|a| a.contains("application/dicom+json")));
}

#[test]
fn no_content_means_no_matches() {
    let (addr, _) = mock_pacs();
    let client = DicomWebClient::new().unwrap();
    assert!(client.query_series(&endpoint(addr), "empty").unwrap().is_empty());
}

#[test]
fn http_errors_carry_the_status() {
    let (addr, _) = mock_pacs();
    let client = DicomWebClient::new().unwrap();
    match client.query_instances(&endpoint(addr), "1.2.3", "1.2.3.1") {
        Err(PacsError::Http { status, url }) => {
            assert_eq!(status, 404);
            assert!(url.ends_with("/studies/1.2.3/series/1.2.3.1/instances"));
        }
        other => panic!("expected HTTP error, got {:?}", other),
    }
}

#[test]
fn wado_requests_negotiate_media_types() {
    let (addr, accepts) = mock_pacs();
    let client = DicomWebClient::new().unwrap();
    let endpoint = endpoint(addr);

    let part10 = client.retrieve_instance(&endpoint, "1", "2", "3").unwrap();
    assert_eq!(part10, b"DICM-BYTES".to_vec());
    let png = client
        .retrieve_rendered(&endpoint, "1", "2", "3", RenderedMediaType::Png)
        .unwrap();
    assert_eq!(&png[1..], b"PNG");

    let log = accepts.lock().unwrap();
    assert_eq!(log.as_slice(), ["application/dicom", "image/png"]);
}

#[test]
fn missing_service_url_is_a_configuration_error() {
    let client = DicomWebClient::new().unwrap();
    let no_wado = DicomWebEndpoint {
        qido_rs_url: Some("http://127.0.0.1:9/dicom-web".into()),
        ..Default::default()
    };
    let err = client.retrieve_instance(&no_wado, "1", "2", "3").unwrap_err();
    assert!(err.is_configuration());
}

/// Legacy backend whose C-MOVE completes immediately with one failed sub-operation.
struct InstantMove;

impl LegacyBackend for InstantMove {
    fn echo(&self, _: &RemoteNode) -> EchoResult {
        EchoResult::success(2)
    }

    fn find(&self, _: &RemoteNode, _: QueryLevel, _: &QueryFilters) -> Result<Vec<Attributes>> {
        Ok(Vec::new())
    }

    fn move_to(&self, _: &RemoteNode, _: &MoveScope, _: &str, handle: &RetrievalHandle) -> Result<MoveResult> {
        handle.start()?;
        handle.record_progress(SubOperationCounts {
            remaining: Some(0),
            completed: 3,
            failed: 1,
            warning: 0,
        })?;
        let progress = handle.finish(RetrievalStatus::CompletedWithErrors, None)?;
        Ok(MoveResult::from_progress(&progress))
    }

    fn store_file(&self, _: &RemoteNode, _: &Path) -> Result<StoreOutcome> {
        Err(PacsError::Unsupported("store".into()))
    }
}

fn api_server() -> String {
    let (pacs_addr, _) = mock_pacs();
    let registry = PacsRegistry::new(vec![
        PacsConfig::legacy("legacy", RemoteNode::new("ORTHANC", "pacs.local", 4242)),
        PacsConfig::dicom_web("web", endpoint(pacs_addr)),
    ]);
    let router = PacsRouter::new(registry, InstantMove, DicomWebClient::new().unwrap(), "VIEWER");
    let addr = serve(web::app(Arc::new(router)));
    format!("http://{}", addr)
}

#[test]
fn rest_api_routes_queries_and_tracks_retrievals() {
    let base = api_server();
    let http = reqwest::blocking::Client::new();

    let pacs: Value = http.get(format!("{}/api/pacs", base)).send().unwrap().json().unwrap();
    assert_eq!(pacs.as_array().unwrap().len(), 2);

    let echo: Value = http
        .post(format!("{}/api/pacs/legacy/echo", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(echo["success"], true);

    let studies: Value = http
        .get(format!("{}/api/pacs/web/studies?PatientID=PAT1", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(studies[0]["PatientID"], "PAT1");

    let wado = http
        .get(format!("{}/api/pacs/web/studies/1/series/2/instances/3?rendered=png", base))
        .send()
        .unwrap();
    assert_eq!(wado.status(), 200);
    assert_eq!(wado.headers()[header::CONTENT_TYPE].to_str().unwrap(), "image/png");

    let accepted = http
        .post(format!("{}/api/pacs/legacy/studies/1.2.3/retrieve", base))
        .json(&json!({ "destination_ae": "ARCHIVE" }))
        .send()
        .unwrap();
    assert_eq!(accepted.status(), 202);
    let ticket: Value = accepted.json().unwrap();
    let status_url = format!("{}{}", base, ticket["status_url"].as_str().unwrap());

    let mut progress = Value::Null;
    for _ in 0..100 {
        progress = http.get(&status_url).send().unwrap().json().unwrap();
        if progress["status"] == "COMPLETED_WITH_ERRORS" {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(progress["status"], "COMPLETED_WITH_ERRORS");
    assert_eq!(progress["completed"], 3);
    assert_eq!(progress["failed"], 1);
    assert_eq!(progress["total"], 4);
    assert_eq!(progress["percent_complete"], 75);
    assert_eq!(progress["remaining"], 0);

    let cancel = http.delete(&status_url).send().unwrap();
    assert_eq!(cancel.status(), 409);
}

#[test]
fn rest_api_maps_errors_to_statuses() {
    let base = api_server();
    let http = reqwest::blocking::Client::new();

    let unknown = http.post(format!("{}/api/pacs/missing/echo", base)).send().unwrap();
    assert_eq!(unknown.status(), 404);

    let move_on_web = http
        .post(format!("{}/api/pacs/web/studies/1.2.3/retrieve", base))
        .json(&json!({}))
        .send()
        .unwrap();
    assert_eq!(move_on_web.status(), 400);

    let bad_id = http.get(format!("{}/api/retrievals/not-a-uuid", base)).send().unwrap();
    assert_eq!(bad_id.status(), 404);

    let upstream = http
        .get(format!("{}/api/pacs/web/studies/1/series/2/instances", base))
        .send()
        .unwrap();
    assert_eq!(upstream.status(), 502);
}
