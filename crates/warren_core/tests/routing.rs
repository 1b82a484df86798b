//! Router-level behavior: the URL grammar, CORS, the built-in agent
//! endpoints and JSON-RPC over HTTP.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use warren_core::{
    agent_router, AgentClass, AgentHandler, CorsConfig, RouterConfig, Runtime, RuntimeConfig,
};

struct TestHandler;

impl AgentHandler for TestHandler {}

fn test_class() -> AgentClass {
    AgentClass::builder("TestAgent", TestHandler)
        .callable("addNumbers", |_agent, args| async move {
            let sum = args
                .iter()
                .filter_map(Value::as_i64)
                .sum::<i64>();
            Ok(json!(sum))
        })
        .build()
}

fn test_runtime() -> Runtime {
    Runtime::builder()
        .config(RuntimeConfig::ephemeral())
        .register(test_class())
        .build()
        .unwrap()
}

fn router_with_cors(cors: CorsConfig) -> axum::Router {
    agent_router(
        test_runtime(),
        RouterConfig {
            cors,
            ..Default::default()
        },
    )
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn cors_preflight_returns_default_headers() {
    let app = router_with_cors(CorsConfig::Enabled(true));

    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/agents/test-agent/x")
                .header("Origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(
        headers["access-control-allow-methods"],
        "GET, POST, HEAD, OPTIONS"
    );
    assert_eq!(headers["access-control-allow-credentials"], "true");
}

#[tokio::test]
async fn cors_custom_map_replaces_defaults() {
    let mut map = std::collections::BTreeMap::new();
    map.insert(
        "Access-Control-Allow-Origin".to_string(),
        "https://app.example".to_string(),
    );
    let app = router_with_cors(CorsConfig::Headers(map));

    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/agents/test-agent/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers["access-control-allow-origin"],
        "https://app.example"
    );
    assert!(headers.get("access-control-allow-methods").is_none());
}

#[tokio::test]
async fn unmatched_paths_fall_through() {
    let app = router_with_cors(CorsConfig::Enabled(false));

    // Nothing outside the grammar is registered; these hit axum's
    // default fallback, not the agent handler.
    for uri in ["/", "/other/test-agent/x", "/agents/test-agent"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri: {uri}");
    }
}

#[tokio::test]
async fn composes_with_a_caller_fallback() {
    let app = router_with_cors(CorsConfig::Enabled(false)).merge(
        axum::Router::new().fallback(|| async { (StatusCode::IM_A_TEAPOT, "caller fallback") }),
    );

    // Unmatched paths reach the caller's fallback.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/elsewhere")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

    // Matched paths are still routed to the agent.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/agents/test-agent/x/getState")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_class_is_not_found() {
    let app = router_with_cors(CorsConfig::Enabled(false));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/agents/no-such-class/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn set_then_get_state_round_trips() {
    let app = router_with_cors(CorsConfig::Enabled(false));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/agents/test-agent/alice/setState")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"counter": 7, "tags": ["a", "b"]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"success": true}));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/agents/test-agent/alice/getState")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"counter": 7, "tags": ["a", "b"]})
    );
}

#[tokio::test]
async fn malformed_set_state_is_a_500_with_error() {
    let app = router_with_cors(CorsConfig::Enabled(false));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/agents/test-agent/alice/setState")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body.get("error").is_some());
}

#[tokio::test]
async fn jsonrpc_dispatches_callable_methods() {
    let app = router_with_cors(CorsConfig::Enabled(false));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/agents/test-agent/m")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"jsonrpc":"2.0","method":"addNumbers","params":[15,27],"id":"m"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"jsonrpc": "2.0", "id": "m", "result": 42})
    );
}

#[tokio::test]
async fn jsonrpc_unknown_method_yields_error_envelope() {
    let app = router_with_cors(CorsConfig::Enabled(false));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/agents/test-agent/m")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"jsonrpc":"2.0","method":"noSuchMethod","params":[],"id":7}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["id"], json!(7));
    assert_eq!(body["error"]["code"], json!(-32601));
    assert_eq!(body["error"]["message"], json!("method not found"));
}

#[tokio::test]
async fn cors_headers_apply_to_routed_responses() {
    let app = router_with_cors(CorsConfig::Enabled(true));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/agents/test-agent/alice/getState")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "*"
    );
}
