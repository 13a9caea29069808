//! Plain HTTP routes

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use tower::ServiceExt;
use tts_core::scripted::ScriptedBackend;
use tts_server::router;

use common::*;

#[tokio::test]
async fn test_health_check() {
    let (state, _shutdown) = test_state(ScriptedBackend::counting(1, 4, 24_000));
    let response = router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_metrics_after_a_job() {
    let server = spawn_server(ScriptedBackend::counting(4, 4, 24_000)).await;
    let mut client = connect(server.addr).await;
    send_json(&mut client, serde_json::json!({"command": "synthesize", "text": "count me"})).await;
    collect_job(&mut client).await;

    let response = router(server.state.clone())
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let metrics: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metrics["jobs_started"], 1);
    assert_eq!(metrics["jobs_completed"], 1);
    assert_eq!(metrics["jobs_failed"], 0);
    assert_eq!(metrics["chunks_sent"], 4);
    assert_eq!(metrics["sessions_active"], 1);
    assert!(metrics["uptime_seconds"].is_u64());

    server.shutdown().await;
}

#[tokio::test]
async fn test_plain_get_on_ws_route_is_rejected() {
    let (state, _shutdown) = test_state(ScriptedBackend::counting(1, 4, 24_000));
    let response = router(state)
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}
