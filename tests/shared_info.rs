//! Identity exchange over HTTP

use std::net::SocketAddr;

use hierhist_core::HelperSharedInfo;
use hierhist_helper::{create_router, read_helper_shared_info};
use reqwest::Client;
use tokio::net::TcpListener;

async fn spawn_server(info: HelperSharedInfo) -> (String, tokio::sync::oneshot::Sender<()>) {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_router(info, None);
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (format!("http://{}", addr), tx)
}

#[tokio::test]
async fn test_partner_reads_shared_info() {
    let info = HelperSharedInfo::new("helper-b", "/mnt/shared/helper-b");
    let (url, _shutdown) = spawn_server(info.clone()).await;

    let fetched = read_helper_shared_info(&url).await.unwrap();
    assert_eq!(fetched, info);

    // Trailing slash in the configured URL is tolerated
    let fetched = read_helper_shared_info(&format!("{}/", url)).await.unwrap();
    assert_eq!(fetched.shared_dir, info.shared_dir);
}

#[tokio::test]
async fn test_health_and_no_metrics_route() {
    let (url, _shutdown) = spawn_server(HelperSharedInfo::new("helper-a", "/shared")).await;
    let http = Client::new();

    let health: serde_json::Value = http
        .get(format!("{}/health", url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["origin"], "helper-a");

    let metrics = http.get(format!("{}/metrics", url)).send().await.unwrap();
    assert_eq!(metrics.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unreachable_partner_is_an_error() {
    // Bind and drop to get a port nobody listens on
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    assert!(read_helper_shared_info(&format!("http://{}", addr)).await.is_err());
}
