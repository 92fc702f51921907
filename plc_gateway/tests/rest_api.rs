use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use plc_gateway::api::rest::{create_api_routes, AppState};
use plc_gateway::drivers::mock::MockDriver;
use plc_gateway::drivers::traits::DriverConfig;
use plc_gateway::health::HealthRegistry;
use plc_gateway::poll::{NullObserver, PollSettings, Poller, PollerHandle};
use plc_gateway::tags::store::TagStore;
use plc_gateway::tags::structures::PlcName;

struct TestContext {
    state: AppState,
    health: Arc<HealthRegistry>,
    shutdown: CancellationToken,
}

fn context() -> TestContext {
    context_with(None, HashMap::new())
}

fn context_with(
    ready_file: Option<std::path::PathBuf>,
    writers: HashMap<PlcName, PollerHandle>,
) -> TestContext {
    let store = TagStore::new(HashSet::from([PlcName::CompactLogix, PlcName::Slc500]));
    let health = Arc::new(HealthRegistry::new(ready_file));
    health.register(PlcName::CompactLogix, "10.0.0.1");
    health.register(PlcName::Slc500, "10.0.0.2");
    let shutdown = CancellationToken::new();
    let state = AppState {
        store,
        health: Arc::clone(&health),
        writers: Arc::new(writers),
        shutdown: shutdown.clone(),
    };
    TestContext {
        state,
        health,
        shutdown,
    }
}

fn app(ctx: &TestContext) -> Router {
    create_api_routes().with_state(ctx.state.clone())
}

/// Keeps a (never-run) poller's write queue alive behind the handle.
fn compactlogix_writer() -> (PollerHandle, Poller) {
    let driver = MockDriver::new(
        DriverConfig {
            plc: PlcName::CompactLogix,
            endpoint: "mock".to_string(),
            socket_timeout: Duration::from_secs(1),
        },
        Arc::new(AtomicBool::new(false)),
    );
    let (poller, handle) = Poller::new(
        Box::new(driver),
        TagStore::new(HashSet::from([PlcName::CompactLogix])),
        Arc::new(NullObserver),
        PollSettings {
            poll_period: Duration::from_secs(1),
            reconnect_base: 1.0,
            reconnect_max: 8.0,
        },
        CancellationToken::new(),
    );
    (handle, poller)
}

async fn request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<JsonValue>,
) -> (StatusCode, JsonValue) {
    let builder = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn decimal_tag_body() -> JsonValue {
    json!({
        "id": "T",
        "plc": "compactlogix",
        "address": "Main.Temp",
        "datatype": "Decimal",
        "value": "1.2300"
    })
}

#[tokio::test]
async fn s1_decimal_round_trip_is_exact() {
    let ctx = context();
    let app = app(&ctx);

    let (status, created) =
        request(&app, Method::POST, "/api/v1/tags", Some(decimal_tag_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["value"], json!("1.2300"));

    let (status, body) = request(&app, Method::GET, "/api/v1/tags/T", None).await;
    assert_eq!(status, StatusCode::OK);
    // Character for character, four digits after the point.
    assert_eq!(body["value"].as_str().unwrap(), "1.2300");
    assert_eq!(body["quality"], json!("Good"));
}

#[tokio::test]
async fn s2_numeric_passthrough_stays_a_number() {
    let ctx = context();
    let app = app(&ctx);

    let body = json!({
        "id": "N",
        "plc": "compactlogix",
        "address": "Main.Count",
        "datatype": "Int",
        "value": 7
    });
    let (status, _) = request(&app, Method::POST, "/api/v1/tags", Some(body)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(&app, Method::GET, "/api/v1/tags/N", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["value"].is_number());
    assert_eq!(body["value"], json!(7));
}

#[tokio::test]
async fn duplicate_id_conflicts() {
    let ctx = context();
    let app = app(&ctx);

    let (status, _) = request(&app, Method::POST, "/api/v1/tags", Some(decimal_tag_body())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) =
        request(&app, Method::POST, "/api/v1/tags", Some(decimal_tag_body())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn datatype_mismatch_is_unprocessable() {
    let ctx = context();
    let app = app(&ctx);

    let body = json!({
        "id": "N",
        "plc": "compactlogix",
        "address": "Main.Count",
        "datatype": "Int",
        "value": "seven"
    });
    let (status, _) = request(&app, Method::POST, "/api/v1/tags", Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn malformed_decimal_text_is_bad_request() {
    let ctx = context();
    let app = app(&ctx);

    let body = json!({
        "id": "D",
        "plc": "compactlogix",
        "address": "Main.Temp",
        "datatype": "Decimal",
        "value": "not a number"
    });
    let (status, _) = request(&app, Method::POST, "/api/v1/tags", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unregistered_controller_is_bad_request() {
    let ctx = context();
    let app = app(&ctx);

    let body = json!({
        "id": "M",
        "plc": "mock",
        "address": "A1",
        "datatype": "Int",
        "value": 1
    });
    let (status, _) = request(&app, Method::POST, "/api/v1/tags", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_tag_is_not_found() {
    let ctx = context();
    let app = app(&ctx);

    let (status, _) = request(&app, Method::GET, "/api/v1/tags/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(
        &app,
        Method::PATCH,
        "/api/v1/tags/nope",
        Some(json!({"value": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(&app, Method::DELETE, "/api/v1/tags/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn patch_enforces_writability_but_can_unlock() {
    let ctx = context();
    let app = app(&ctx);

    let body = json!({
        "id": "N",
        "plc": "compactlogix",
        "address": "Main.Count",
        "datatype": "Int",
        "value": 7
    });
    request(&app, Method::POST, "/api/v1/tags", Some(body)).await;

    // writable defaults to false
    let (status, _) = request(
        &app,
        Method::PATCH,
        "/api/v1/tags/N",
        Some(json!({"value": 9})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = request(
        &app,
        Method::PATCH,
        "/api/v1/tags/N",
        Some(json!({"value": 9, "writable": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!(9));
    assert_eq!(body["writable"], json!(true));
}

#[tokio::test]
async fn patch_value_shape_is_checked() {
    let ctx = context();
    let app = app(&ctx);

    let body = json!({
        "id": "N",
        "plc": "compactlogix",
        "address": "Main.Count",
        "datatype": "Int",
        "value": 7,
        "writable": true
    });
    request(&app, Method::POST, "/api/v1/tags", Some(body)).await;

    let (status, _) = request(
        &app,
        Method::PATCH,
        "/api/v1/tags/N",
        Some(json!({"value": 1.5})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn fresh_reads_refuse_faulted_controllers() {
    let ctx = context();
    let app = app(&ctx);
    request(&app, Method::POST, "/api/v1/tags", Some(decimal_tag_body())).await;

    // Default: cached data is served even while the controller is down.
    let (status, _) = request(&app, Method::GET, "/api/v1/tags/T", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&app, Method::GET, "/api/v1/tags/T?fresh=true", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    ctx.health.mark_connected(PlcName::CompactLogix);
    let (status, _) = request(&app, Method::GET, "/api/v1/tags/T?fresh=true", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn delete_reports_the_id() {
    let ctx = context();
    let app = app(&ctx);

    request(&app, Method::POST, "/api/v1/tags", Some(decimal_tag_body())).await;
    let (status, body) = request(&app, Method::DELETE, "/api/v1/tags/T", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"deleted": "T"}));

    let (status, _) = request(&app, Method::GET, "/api/v1/tags/T", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn hmi_data_is_keyed_by_id() {
    let ctx = context();
    let app = app(&ctx);

    request(&app, Method::POST, "/api/v1/tags", Some(decimal_tag_body())).await;
    let body = json!({
        "id": "N",
        "plc": "slc500",
        "address": "N7:0",
        "datatype": "Int",
        "value": 7
    });
    request(&app, Method::POST, "/api/v1/tags", Some(body)).await;

    let (status, data) = request(&app, Method::GET, "/api/v1/hmi/data", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(data["T"]["value"], json!("1.2300"));
    assert_eq!(data["N"]["value"], json!(7));
    assert_eq!(data["N"]["plc"], json!("slc500"));
}

#[tokio::test]
async fn s5_readiness_flow_and_ready_file() {
    let ready_path =
        std::env::temp_dir().join(format!("plc-gateway-ready-{}", std::process::id()));
    let _ = std::fs::remove_file(&ready_path);
    let ctx = context_with(Some(ready_path.clone()), HashMap::new());
    let app = app(&ctx);

    // Immediately after startup: not ready, no file.
    let (status, body) = request(&app, Method::GET, "/api/v1/hmi/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], json!(false));
    assert!(!ready_path.exists());

    // Prepopulation done + every controller connected once => ready.
    ctx.health.set_prepopulated();
    ctx.health.mark_connected(PlcName::CompactLogix);
    let (status, _) = request(&app, Method::GET, "/api/v1/hmi/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    ctx.health.mark_connected(PlcName::Slc500);
    let (status, body) = request(&app, Method::GET, "/api/v1/hmi/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ready": true}));

    // One ISO-8601 line, atomically written.
    let content = std::fs::read_to_string(&ready_path).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(chrono::DateTime::parse_from_rfc3339(content.trim()).is_ok());
    let _ = std::fs::remove_file(&ready_path);
}

#[tokio::test]
async fn hmi_health_exposes_per_plc_entries() {
    let ctx = context();
    let app = app(&ctx);

    ctx.health.mark_failed(PlcName::CompactLogix, "no route to host");
    ctx.health.record_backoff(PlcName::CompactLogix, 2.0);

    let (status, body) = request(&app, Method::GET, "/api/v1/hmi/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], json!(false));
    assert_eq!(body["state"], json!("initializing"));

    let clx = &body["plcs"]["compactlogix"];
    assert_eq!(clx["connected"], json!(false));
    assert_eq!(clx["fail_count"], json!(1));
    assert_eq!(clx["last_backoff_s"], json!(2.0));
    assert_eq!(clx["last_error"], json!("no route to host"));
    assert_eq!(body["plcs"]["slc500"]["fail_count"], json!(0));
}

#[tokio::test]
async fn s6_stop_is_acknowledged_and_revokes_readiness() {
    let ctx = context();
    let app = app(&ctx);

    ctx.health.set_prepopulated();
    ctx.health.mark_connected(PlcName::CompactLogix);
    ctx.health.mark_connected(PlcName::Slc500);
    let (status, _) = request(&app, Method::GET, "/api/v1/hmi/ready", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(&app, Method::POST, "/api/v1/hmi/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"stopping": true}));
    assert!(ctx.shutdown.is_cancelled());

    let (status, _) = request(&app, Method::GET, "/api/v1/hmi/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn value_patches_write_through_until_the_queue_fills() {
    let (handle, _poller) = compactlogix_writer();
    let ctx = context_with(None, HashMap::from([(PlcName::CompactLogix, handle)]));
    let app = app(&ctx);

    let body = json!({
        "id": "N",
        "plc": "compactlogix",
        "address": "Main.Count",
        "datatype": "Int",
        "value": 0,
        "writable": true
    });
    request(&app, Method::POST, "/api/v1/tags", Some(body)).await;

    // The poller behind the handle never runs, so the bounded queue fills.
    for n in 0..64 {
        let (status, _) = request(
            &app,
            Method::PATCH,
            "/api/v1/tags/N",
            Some(json!({"value": n})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _) = request(
        &app,
        Method::PATCH,
        "/api/v1/tags/N",
        Some(json!({"value": 999})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // The overflowing patch changed nothing.
    let (_, body) = request(&app, Method::GET, "/api/v1/tags/N", None).await;
    assert_eq!(body["value"], json!(63));
}
