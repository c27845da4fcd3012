use inventory_sync::connectivity::HealthCheck;
use inventory_sync::model::ProductFields;
use inventory_sync::remote::{HttpInventoryClient, InventoryApi, RemoteError};
use reqwest::Url;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Captured {
    request_line: String,
    body: String,
}

/// Serve `responses` to consecutive connections, one request each, and hand
/// back what was received.
async fn stub_server(responses: Vec<(u16, &'static str)>) -> (Url, JoinHandle<Vec<Captured>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut captured = Vec::new();
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let head_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let content_length = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < head_end + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            captured.push(Captured {
                request_line: head.lines().next().unwrap_or_default().to_string(),
                body: String::from_utf8_lossy(&buf[head_end..]).to_string(),
            });

            let response = format!(
                "HTTP/1.1 {} STATUS\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }
        captured
    });
    let base = Url::parse(&format!("http://{}/api/", addr)).unwrap();
    (base, handle)
}

fn client(base: Url) -> HttpInventoryClient {
    HttpInventoryClient::new(base, None, Duration::from_secs(5)).unwrap()
}

fn widget() -> ProductFields {
    ProductFields {
        name: "Widget".into(),
        description: String::new(),
        price: 10.0,
        quantity: 5,
        sku: "W-1".into(),
        category: String::new(),
        image_url: None,
    }
}

/// A URL nothing listens on.
async fn closed_base() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{}/api/", addr)).unwrap()
}

#[tokio::test]
async fn create_posts_record_and_reads_numeric_id() {
    let (base, server) = stub_server(vec![(201, r#"{"id":42,"name":"Widget"}"#)]).await;
    let created = client(base).create_product(&widget()).await.unwrap();
    assert_eq!(created.id, "42");

    let captured = server.await.unwrap();
    assert_eq!(captured[0].request_line, "POST /api/products HTTP/1.1");
    let sent: ProductFields = serde_json::from_str(&captured[0].body).unwrap();
    assert_eq!(sent, widget());
}

#[tokio::test]
async fn update_and_delete_hit_record_paths() {
    let (base, server) = stub_server(vec![(200, r#"{"id":"7"}"#), (200, "{}")]).await;
    let c = client(base);
    c.update_product("7", &widget()).await.unwrap();
    c.delete_product("7").await.unwrap();

    let captured = server.await.unwrap();
    assert_eq!(captured[0].request_line, "PATCH /api/products/7 HTTP/1.1");
    assert!(captured[0].body.contains("\"quantity\":5"));
    assert_eq!(captured[1].request_line, "DELETE /api/products/7 HTTP/1.1");
    assert!(captured[1].body.is_empty());
}

#[tokio::test]
async fn error_statuses_are_classified() {
    let (base, server) = stub_server(vec![
        (404, r#"{"error":"Not found"}"#),
        (503, r#"{"error":"down"}"#),
        (422, r#"{"error":"bad price"}"#),
    ])
    .await;
    let c = client(base);

    assert!(matches!(
        c.delete_product("1").await,
        Err(RemoteError::NotFound)
    ));
    let err = c.delete_product("1").await.unwrap_err();
    assert!(err.is_retryable());
    match c.update_product("1", &widget()).await.unwrap_err() {
        RemoteError::Rejected { status, body } => {
            assert_eq!(status, 422);
            assert!(body.contains("bad price"));
        }
        other => panic!("unexpected {:?}", other),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn unreadable_create_response_is_not_retryable() {
    let (base, server) = stub_server(vec![(201, "created")]).await;
    let err = client(base).create_product(&widget()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Invalid(_)));
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_service_is_transient_and_offline() {
    let c = client(closed_base().await);
    let err = c.create_product(&widget()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!c.check().await);
}

#[tokio::test]
async fn health_check_reports_online() {
    let (base, server) = stub_server(vec![(200, r#"{"status":"ok"}"#)]).await;
    assert!(client(base).check().await);
    let captured = server.await.unwrap();
    assert_eq!(captured[0].request_line, "GET /api/health HTTP/1.1");
}
