//! HTTP ingestion endpoint
//!
//! A minimal HTTP server feeding the gateway: POST a payload, get the
//! delivery outcome back. TLS termination and anything fancier belongs
//! in front of this (reverse proxy).

mod handlers;
mod parse;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, trace, warn};

use courier_core::Gateway;
use handlers::handle_notify;
use parse::{find_header_end, http_response, parse_content_length};

/// Largest accepted request (headers + body)
const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// Run the ingestion server
pub async fn run_ingest_server(gateway: Arc<Gateway>, port: u16) {
    let listener = match TcpListener::bind(format!("0.0.0.0:{}", port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("❌ Failed to bind ingestion port {}: {}", port, e);
            return;
        }
    };

    info!(port = port, "ingestion server started");

    loop {
        let (mut socket, _) = match listener.accept().await {
            Ok(s) => s,
            Err(_) => continue,
        };

        let gateway = gateway.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_REQUEST_BYTES];
            let mut total_read = 0;

            // Read until we have complete HTTP request (headers + body based on Content-Length)
            loop {
                let n = match socket.read(&mut buf[total_read..]).await {
                    Ok(0) => break, // EOF
                    Ok(n) => n,
                    Err(_) => return,
                };
                total_read += n;

                let data = &buf[..total_read];
                let header_end = match find_header_end(data) {
                    Some(pos) => pos,
                    None => {
                        if total_read >= buf.len() {
                            warn!("ingestion: request too large");
                            return;
                        }
                        continue; // keep reading until we have headers
                    }
                };

                let headers = String::from_utf8_lossy(&data[..header_end]);
                let content_length = parse_content_length(&headers);
                let expected_total = header_end + content_length;

                if expected_total > buf.len() {
                    warn!(bytes = expected_total, "ingestion: request too large");
                    let resp = http_response(400, "request too large");
                    let _ = socket.write_all(resp.as_bytes()).await;
                    return;
                }
                if total_read >= expected_total {
                    break; // we have everything
                }
            }

            if total_read == 0 {
                return;
            }

            let header_end = find_header_end(&buf[..total_read]).unwrap_or(total_read);
            let headers = String::from_utf8_lossy(&buf[..header_end]).into_owned();
            let body = &buf[header_end..total_read];

            let response = handle_request(&gateway, &headers, body).await;

            if let Err(e) = socket.write_all(response.as_bytes()).await {
                warn!("ingestion: failed to send response: {}", e);
                return;
            }

            // Explicitly shutdown the socket to signal EOF to curl
            if let Err(e) = socket.shutdown().await {
                trace!("ingestion: socket shutdown error (expected): {}", e);
            }
        });
    }
}

async fn handle_request(gateway: &Gateway, headers: &str, body: &[u8]) -> String {
    let first_line = headers.lines().next().unwrap_or_default();
    let mut parts = first_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => return http_response(400, "bad request line"),
    };

    match (method, path) {
        ("POST", "/") | ("POST", "/notify") => handle_notify(gateway, headers, body).await,
        ("GET", "/health") => http_response(200, "OK"),
        ("POST", _) => http_response(404, "not found"),
        _ => http_response(405, "method not allowed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::testing::MockTransport;
    use courier_core::GatewayConfig;
    use tempfile::TempDir;

    async fn test_gateway() -> (Arc<Gateway>, Arc<MockTransport>, TempDir) {
        let mock = Arc::new(MockTransport::new());
        let temp_dir = TempDir::new().unwrap();
        let config =
            GatewayConfig::for_testing().with_db_path(temp_dir.path().join("courier.db"));
        let gateway = Arc::new(
            Gateway::start_with_transport(config, mock.clone())
                .await
                .unwrap(),
        );
        (gateway, mock, temp_dir)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (gateway, _mock, _dir) = test_gateway().await;
        let resp = handle_request(&gateway, "GET /health HTTP/1.1", b"").await;
        assert!(resp.starts_with("HTTP/1.1 200"));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_path_not_found() {
        let (gateway, _mock, _dir) = test_gateway().await;
        let resp = handle_request(&gateway, "POST /other HTTP/1.1", b"x").await;
        assert!(resp.starts_with("HTTP/1.1 404"));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let (gateway, _mock, _dir) = test_gateway().await;
        let resp = handle_request(&gateway, "DELETE / HTTP/1.1", b"").await;
        assert!(resp.starts_with("HTTP/1.1 405"));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_post_notify_routes_to_handler() {
        let (gateway, mock, _dir) = test_gateway().await;
        let headers = "POST /notify HTTP/1.1\r\nContent-Type: text/plain";
        let resp = handle_request(&gateway, headers, b"ping").await;
        assert!(resp.starts_with("HTTP/1.1 200"));
        assert_eq!(mock.sent_events().len(), 1);
        gateway.stop().await;
    }
}
