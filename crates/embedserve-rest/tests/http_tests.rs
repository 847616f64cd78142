//! End-to-end HTTP tests driving the router in-process.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use embedserve_embedding::{MockBackend, MockLoader};
use embedserve_rest::{build_router, AppState};
use embedserve_service::{Config, EmbeddingService, ServiceOptions};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::ServiceExt; // for `oneshot`

/// Initialize tracing for tests (call once)
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("embedserve_rest=debug,embedserve_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Router over the default configuration with every model loaded.
async fn create_test_app() -> Router {
    init_tracing();
    let service = Arc::new(EmbeddingService::from_config(&Config::default()).unwrap());
    for handle in service.registry().handles() {
        handle.wait_settled().await;
    }
    build_router(AppState::new(service))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn post_json(app: Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_ready_endpoint() {
    let app = create_test_app().await;
    let (status, body) = get(app, "/ready").await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "ready": true }));
}

#[tokio::test]
async fn test_ready_is_unavailable_while_loading() {
    init_tracing();
    let service = Arc::new(EmbeddingService::new(ServiceOptions::default()).unwrap());
    let gate = Arc::new(Notify::new());
    let handle = service
        .register_model(
            MockBackend::DEFAULT_MODEL,
            vec![],
            Arc::new(MockLoader::new(MockBackend::new()).with_gate(gate.clone())),
        )
        .unwrap();
    let app = build_router(AppState::new(service));

    let (status, body) = get(app.clone(), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "ready": false }));

    let (status, body) = post_json(
        app.clone(),
        "/v1/embeddings",
        json!({ "input": ["hello"], "model": MockBackend::DEFAULT_MODEL }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "model_not_ready");

    gate.notify_one();
    handle.wait_settled().await;

    let (status, _) = get(app, "/ready").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_alive_endpoint() {
    let app = create_test_app().await;
    let (status, body) = get(app, "/alive").await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "alive": true }));
}

#[tokio::test]
async fn test_model_info() {
    let app = create_test_app().await;
    let (status, body) = get(
        app.clone(),
        "/v1/info?model_name=sentence-transformers/all-MiniLM-L6-v2",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["name"], "sentence-transformers/all-MiniLM-L6-v2");
    assert_eq!(info["status"], "ready");
    assert_eq!(info["max_sequence_length"], 256);
    assert_eq!(info["embedding_dim"], 384);

    let (status, body) = get(app.clone(), "/v1/info?model_name=all-MiniLM-L6-v2").await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["name"], "sentence-transformers/all-MiniLM-L6-v2");

    let (status, body) = get(app, "/v1/info?model_name=no-such-model").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["kind"], "unknown_model");
}

#[tokio::test]
async fn test_list_models() {
    let app = create_test_app().await;
    let (status, body) = get(app, "/v1/models").await;

    assert_eq!(status, StatusCode::OK);
    let models: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(models.as_array().unwrap().len(), 1);
    assert_eq!(models[0]["name"], "sentence-transformers/all-MiniLM-L6-v2");
    assert_eq!(models[0]["status"], "ready");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = create_test_app().await;
    let (status, body) = get(app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("all-MiniLM-L6-v2"));
}

#[tokio::test]
async fn test_chunking_basic() {
    let app = create_test_app().await;
    let long_text = "This is a very long document. ".repeat(1000);

    let (status, body) = post_json(
        app,
        "/v1/embeddings",
        json!({
            "input": [long_text],
            "model": "all-MiniLM-L6-v2",
            "normalize": false
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert!(data.len() > 1);
    assert!(data[0].get("embedding").is_some());
    for (position, item) in data.iter().enumerate() {
        assert_eq!(item["index"], 0);
        assert_eq!(item["chunk_index"], position);
        assert_eq!(item["embedding"].as_array().unwrap().len(), 384);
    }
    assert_eq!(body["usage"]["chunks"], data.len());
    assert!(body.get("errors").is_none());
}

#[tokio::test]
async fn test_single_string_input() {
    let app = create_test_app().await;
    let (status, body) = post_json(
        app,
        "/v1/embeddings",
        json!({ "input": "just one sentence", "model": "all-MiniLM-L6-v2", "normalize": true }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);

    let norm: f64 = data[0]["embedding"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap().powi(2))
        .sum::<f64>()
        .sqrt();
    assert!((norm - 1.0).abs() < 1e-3);
}

#[tokio::test]
async fn test_unknown_model_returns_not_found() {
    let app = create_test_app().await;
    let (status, body) = post_json(
        app.clone(),
        "/v1/embeddings",
        json!({ "input": ["hello"], "model": "no-such-model" }),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "unknown_model");

    // Other models keep serving
    let (status, _) = get(app, "/ready").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_validation_errors() {
    let app = create_test_app().await;

    let (status, body) = post_json(
        app.clone(),
        "/v1/embeddings",
        json!({ "input": [], "model": "all-MiniLM-L6-v2" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    let (status, body) = post_json(app, "/v1/embeddings", json!({ "input": ["no model"] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}
