use std::collections::HashSet;
use std::time::{Duration, Instant};

use loadstorm_accounts::{AccountSelector, AllocatorClient, SelectError, SelectorConfig, VuContext};
use loadstorm_allocator::{spawn, AllocatorConfig};
use reqwest::Client;
use url::Url;

async fn wait_http_ready(client: &Client, base: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(resp) = client.get(format!("{base}/health")).send().await {
            if resp.status().is_success() {
                break;
            }
        }
        if Instant::now() > deadline {
            panic!("allocator not ready");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_next_calls_return_exactly_one_index_each() {
    let handle = spawn(AllocatorConfig::with_start_index(100)).await.unwrap();
    let base = handle.url();
    let client = Client::new();
    wait_http_ready(&client, &base).await;

    // 64 concurrent calls over independent connections: the returned set must
    // be exactly {100, ..., 163} with no duplicates.
    let calls: Vec<_> = (0..64)
        .map(|_| {
            let base = base.clone();
            tokio::spawn(async move {
                let resp = Client::new()
                    .get(format!("{base}/next"))
                    .send()
                    .await
                    .unwrap();
                assert!(resp.status().is_success());
                let body: serde_json::Value = resp.json().await.unwrap();
                body["index"].as_u64().unwrap()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in calls {
        assert!(seen.insert(task.await.unwrap()), "duplicate index issued");
    }
    let expected: HashSet<u64> = (100..164).collect();
    assert_eq!(seen, expected);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn health_and_unknown_routes_follow_the_wire_protocol() {
    let handle = spawn(AllocatorConfig::default()).await.unwrap();
    let base = handle.url();
    let client = Client::new();
    wait_http_ready(&client, &base).await;

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, serde_json::json!({ "ok": true }));

    let resp = client.get(format!("{base}/nope")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "not_found" }));

    // POST to a known path is not part of the protocol either.
    let resp = client.post(format!("{base}/next")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "not_found" }));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let handle = spawn(AllocatorConfig::default()).await.unwrap();
    let base = handle.url();
    let client = Client::new();
    wait_http_ready(&client, &base).await;
    handle.shutdown().await.unwrap();

    let result = client
        .get(format!("{base}/health"))
        .timeout(Duration::from_millis(500))
        .send()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn selector_prefers_the_allocator_and_caches_per_vu() {
    let handle = spawn(AllocatorConfig::with_start_index(0)).await.unwrap();
    let url: Url = handle.url().parse().unwrap();

    // Mode configured as sequential, but the allocator overrides it entirely.
    let selector = AccountSelector::new(SelectorConfig {
        mode: Some("sequential".parse().unwrap()),
        start: Some(0),
        count: Some(4),
        allocator_url: Some(url),
        ..SelectorConfig::default()
    });

    let mut seen = HashSet::new();
    for _ in 0..16 {
        let mut ctx = VuContext::new();
        let picked = selector.select(&mut ctx).await.unwrap();
        assert_eq!(picked.source, "allocator:/next");
        assert!(seen.insert(picked.index), "duplicate index across VUs");

        // Second call within the same VU short-circuits to the cache.
        let again = selector.select(&mut ctx).await.unwrap();
        assert_eq!(again.index, picked.index);
        assert_eq!(again.source, "cached (allocator:/next)");
    }
    let expected: HashSet<u32> = (0..16).collect();
    assert_eq!(seen, expected);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn allocator_timeout_fails_fast() {
    // A listener that never answers: connections are accepted into the
    // backlog but no response ever comes.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url: Url = format!("http://{addr}").parse().unwrap();

    let client = AllocatorClient::new(url, Duration::from_millis(50));
    let started = Instant::now();
    let err = client.next_index().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SelectError::AllocatorUnavailable(_)));
    assert!(
        elapsed < Duration::from_millis(500),
        "timeout took {elapsed:?}"
    );
    drop(listener);
}

#[tokio::test]
async fn garbage_bodies_are_protocol_errors() {
    use axum::routing::get;
    use axum::{Json, Router};

    async fn stub(response: serde_json::Value) -> AllocatorClient {
        let app = Router::new().route("/next", get(move || async move { Json(response) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        AllocatorClient::new(
            format!("http://{addr}").parse().unwrap(),
            Duration::from_secs(2),
        )
    }

    let client = stub(serde_json::json!({ "index": "not-a-number" })).await;
    let err = client.next_index().await.unwrap_err();
    assert!(matches!(err, SelectError::AllocatorProtocolError { .. }));

    let client = stub(serde_json::json!({ "index": -5 })).await;
    let err = client.next_index().await.unwrap_err();
    assert!(matches!(err, SelectError::AllocatorProtocolError { .. }));

    let client = stub(serde_json::json!({ "unrelated": true })).await;
    let err = client.next_index().await.unwrap_err();
    assert!(matches!(err, SelectError::AllocatorProtocolError { .. }));
}
