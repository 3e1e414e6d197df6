//! Liveness surface for the dispatcher process (requires the `http`
//! feature).
#![cfg(feature = "http")]

use std::time::Duration;

use dialog_rust::{http, BufferSink, Consumer, Dispatcher, MemoryQueueStore};

#[tokio::test]
async fn health_reports_alive_then_unavailable() {
    let store = MemoryQueueStore::new();
    let dispatcher = Dispatcher::spawn(store.clone(), || {
        Consumer::new(BufferSink::new()).with_receive_timeout(Duration::from_millis(10))
    });

    let app = http::router(dispatcher.handle(), store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let url = format!("http://{}/health", addr);
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["available"], 0);

    let handle = dispatcher.handle();
    let stats = tokio::task::spawn_blocking(move || dispatcher.stop())
        .await
        .unwrap();
    assert_eq!(stats.delivered, 0);
    assert!(!handle.is_alive());

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], false);
}
