use adstat_adapters::{
    map_records, AdstatSource, AdstatSourceConfig, Credentials, ReportResponse, StatisticsSource,
};
use adstat_core::Variant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/adstat/tgview_sample.json")
}

fn fixture_body() -> String {
    std::fs::read_to_string(fixture_path()).expect("fixture")
}

#[test]
fn tgview_fixture_maps_every_record_in_order() {
    let response: ReportResponse = serde_json::from_str(&fixture_body()).expect("parse fixture");
    let rows = map_records(&response.results, Variant::Accounts).expect("map");

    let keys: Vec<_> = rows.iter().map(|r| (r.object_key.as_str(), r.account_key.as_str())).collect();
    assert_eq!(keys, vec![("u1", "acct"), ("90210", "acct"), ("u2", "second account")]);
    assert!(rows.iter().all(|r| r.date.to_string() == "2024-05-01"));
    assert_eq!(rows[1].spent, Some(0.0));
    assert_eq!(rows[1].price_target, None);
    assert_eq!(rows[2].clicks, Some(41));
}

/// Answers the login and the report request, one connection each.
async fn fake_adstat(report_body: String) -> (String, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let mut seen = Vec::new();
        for _ in 0..2 {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            let mut buf = [0u8; 8192];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let head = String::from_utf8_lossy(&received).to_ascii_lowercase();
            let body = if head.starts_with("post /api/v2/login") {
                r#"{"access_token":"tok-123","token_type":"bearer"}"#.to_string()
            } else {
                report_body.clone()
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            seen.push(head);
        }
        seen
    });
    (format!("http://{addr}"), handle)
}

#[tokio::test]
async fn source_logs_in_then_requests_report_with_bearer_token() {
    let (base_url, server) = fake_adstat(fixture_body()).await;
    let source = AdstatSource::new(AdstatSourceConfig {
        base_url,
        credentials: Credentials {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
        },
        ..Default::default()
    })
    .expect("source");

    let rows = source.fetch().await.expect("fetch");
    assert_eq!(rows.len(), 3);

    let seen = server.await.expect("server");
    assert!(seen[0].starts_with("post /api/v2/login"));
    assert!(seen[1].starts_with("post /api/report/tgview"));
    assert!(seen[1].contains("authorization: bearer tok-123"));
}

#[tokio::test]
async fn report_without_results_is_an_empty_fetch() {
    let (base_url, server) = fake_adstat(r#"{"detail":"no data"}"#.to_string()).await;
    let source = AdstatSource::new(AdstatSourceConfig {
        base_url,
        credentials: Credentials {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
        },
        ..Default::default()
    })
    .expect("source");

    assert!(source.fetch().await.expect("fetch").is_empty());
    server.await.expect("server");
}
