// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use hostwatch_agent::config::validate_config;
use hostwatch_agent::packages::{Package, PackagesPayload};
use hostwatch_agent::queue::DeliveryQueue;
use hostwatch_agent::settings::ApiTarget;
use hostwatch_agent::sync::{HttpsTransport, QueueEntry, SyncState, Synchronizer};
use mockito::{Matcher, Server};
use serde_json::json;

fn synchronizer(server: &Server) -> (Arc<Synchronizer>, Arc<DeliveryQueue<QueueEntry>>) {
    let port = server
        .host_with_port()
        .rsplit(':')
        .next()
        .expect("port")
        .to_string();
    let target = ApiTarget::parse(&format!("localhost:{port}")).expect("valid target");
    assert!(target.is_plaintext());
    let tls = hostwatch_tls::create_tls_client_config().expect("tls config");
    let queue = Arc::new(DeliveryQueue::new(10));
    let sync = Arc::new(Synchronizer::new(
        Arc::new(HttpsTransport::new(target, tls)),
        "test-token",
        Arc::clone(&queue),
    ));
    (sync, queue)
}

#[tokio::test]
async fn config_is_fetched_and_sanitized() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/collect")
        .match_header("authorization", "Bearer test-token")
        .match_header("content-encoding", "gzip")
        .match_header("content-type", "application/json")
        .match_header("content-length", Matcher::Regex(r"^\d+$".to_string()))
        .with_status(200)
        .with_body(
            json!({
                "config": {
                    "enabled": true,
                    "interval": 45,
                    "nginx": {"status_page_url": "http://169.254.169.254/latest"},
                    "redis": {"port": 6380, "password": "pw\r\nFLUSHALL"},
                    "exfiltrate": true
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let (sync, _) = synchronizer(&server);
    let config = sync.get_config().await;
    mock.assert_async().await;

    assert!(config.enabled);
    assert_eq!(config.interval, 45);
    assert!(config.nginx.is_none());
    let redis = config
        .redis
        .as_ref()
        .and_then(|feature| feature.params())
        .expect("redis kept");
    assert_eq!(redis.port, 6380);
    assert_eq!(redis.password.as_deref(), Some("pwFLUSHALL"));
    let rendered = serde_json::to_value(&*config).expect("serializes");
    assert!(rendered.get("exfiltrate").is_none());
}

#[tokio::test]
async fn failed_delivery_is_retried_then_dropped() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/packages")
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let (sync, _) = synchronizer(&server);
    sync.replace_config(validate_config(
        &json!({"request_options": {"retry": 2, "retry_interval": 1, "timeout": 2}}),
    ));

    let payload = PackagesPayload {
        distro: "debian:12".to_string(),
        packages_hash: "abc".to_string(),
        packages: vec![Package {
            name: "bash".to_string(),
            version: "5.2".to_string(),
        }],
    };
    let started = Instant::now();
    assert!(sync.send_packages(&payload).await.is_none());
    assert!(started.elapsed() >= Duration::from_secs(1));
    mock.assert_async().await;
}

#[tokio::test]
async fn packages_response_is_returned_raw() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/packages")
        .with_status(200)
        .with_body(r#"{"accepted": 1}"#)
        .create_async()
        .await;

    let (sync, _) = synchronizer(&server);
    let payload = PackagesPayload {
        distro: "unknown".to_string(),
        packages_hash: "abc".to_string(),
        packages: Vec::new(),
    };
    assert_eq!(
        sync.send_packages(&payload).await,
        Some(json!({"accepted": 1}))
    );
    // The packages endpoint never touches the live configuration.
    assert!(!sync.current_config().enabled);
    mock.assert_async().await;
}

#[tokio::test]
async fn shutdown_drains_the_consumer() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/collect")
        .with_status(200)
        .with_body(r#"{"config": {"enabled": true}}"#)
        .create_async()
        .await;

    let (sync, queue) = synchronizer(&server);
    let handle = sync.start();
    queue.put(QueueEntry::RequestConfig);
    queue.clear();
    sync.stop();
    queue.put(QueueEntry::Shutdown);

    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("synchronizer exits")
        .expect("no panic");
    assert_eq!(sync.state(), SyncState::Stopped);
}
