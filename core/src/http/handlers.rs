//! Ingestion request handlers
//!
//! Turns a decoded HTTP request into a delivery job and waits for its
//! terminal outcome. Malformed requests are rejected here and never
//! reach a queue.

use courier_core::{DeliveryOutcome, Gateway, Payload, Recipient};
use tracing::debug;

use super::parse::{extract_form_field, header_value, http_response, multipart_boundary};

/// Image extensions that must carry an image content type
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "gif", "png", "svg"];

/// Handle `POST /notify` (and `POST /` for compatibility).
pub async fn handle_notify(gateway: &Gateway, headers: &str, body: &[u8]) -> String {
    if let Some(expected) = &gateway.config().api_key {
        let presented = header_value(headers, "Api-Key");
        if presented.as_deref() != Some(expected.as_str()) {
            return http_response(401, "missing or invalid Api-Key header");
        }
    }

    let recipient = match header_value(headers, "Send-To") {
        Some(send_to) => match Recipient::parse(&send_to) {
            Ok(recipient) => Some(recipient),
            Err(reason) => return http_response(400, &reason),
        },
        None => None,
    };
    if recipient.is_none() && gateway.config().management_channel.is_none() {
        return http_response(
            400,
            "no Send-To header and no management channel configured",
        );
    }

    if body.is_empty() {
        return http_response(400, "request body was empty");
    }

    let content_type_header = header_value(headers, "Content-Type")
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let content_type = content_type_header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let payload = if content_type == "multipart/form-data" {
        let Some(boundary) = multipart_boundary(&content_type_header) else {
            return http_response(400, "multipart body without boundary");
        };
        let text = String::from_utf8_lossy(body);
        match extract_form_field(&text, &boundary, "Message") {
            Some(message) if !message.is_empty() => Payload::Text(message),
            _ => return http_response(400, "multipart body without a Message field"),
        }
    } else if content_type == "text/plain" || content_type.is_empty() {
        match std::str::from_utf8(body) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => return http_response(400, "text/plain body is not valid UTF-8"),
        }
    } else {
        let Some(filename) = header_value(headers, "File-Name") else {
            return http_response(
                400,
                "File-Name header missing, add with -H \"File-Name: filename.txt\"",
            );
        };
        if let Err(reason) = validate_media(&filename, &content_type) {
            return http_response(400, &reason);
        }
        Payload::Media {
            bytes: body.to_vec(),
            content_type,
            filename,
        }
    };

    debug!(
        recipient = %recipient.as_ref().map(|r| r.to_string()).unwrap_or_else(|| "<management>".to_string()),
        bytes = payload.len(),
        "ingesting delivery"
    );

    match gateway.submit(recipient, payload).await {
        DeliveryOutcome::Accepted(message_id) => {
            http_response(200, &format!("delivered as {}", message_id))
        }
        DeliveryOutcome::Rejected(reason) => {
            http_response(502, &format!("delivery failed: {}", reason))
        }
    }
}

/// Validate a media filename against its declared content type.
pub fn validate_media(filename: &str, content_type: &str) -> Result<(), String> {
    let extension = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => return Err(format!("file extension missing in {}", filename)),
    };

    if IMAGE_EXTENSIONS.contains(&extension.as_str()) && !content_type.starts_with("image/") {
        return Err(format!(
            "image file {} does not have an image content type (found {})",
            filename, content_type
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::testing::MockTransport;
    use courier_core::GatewayConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_gateway(mock: Arc<MockTransport>, api_key: Option<&str>) -> (Gateway, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config =
            GatewayConfig::for_testing().with_db_path(temp_dir.path().join("courier.db"));
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }
        let gateway = Gateway::start_with_transport(config, mock).await.unwrap();
        (gateway, temp_dir)
    }

    #[tokio::test]
    async fn test_notify_text_plain() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), None).await;

        let headers = "POST /notify HTTP/1.1\r\nContent-Type: text/plain\r\nSend-To: @alice:example.org";
        let resp = handle_notify(&gateway, headers, b"backup done").await;

        assert!(resp.starts_with("HTTP/1.1 200"));
        assert_eq!(
            mock.sent_events()[0].content["body"].as_str().unwrap(),
            "backup done"
        );
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notify_without_send_to_uses_management() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), None).await;

        let headers = "POST / HTTP/1.1\r\nContent-Type: text/plain";
        let resp = handle_notify(&gateway, headers, b"hello ops").await;

        assert!(resp.starts_with("HTTP/1.1 200"));
        assert_eq!(mock.sent_events()[0].channel, "!management:example.org");
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notify_invalid_recipient_rejected() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), None).await;

        let headers = "POST / HTTP/1.1\r\nContent-Type: text/plain\r\nSend-To: not-an-address";
        let resp = handle_notify(&gateway, headers, b"hi").await;

        assert!(resp.starts_with("HTTP/1.1 400"));
        assert_eq!(mock.send_calls(), 0);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notify_wrong_api_key_unauthorized() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), Some("right-key")).await;

        let headers = "POST / HTTP/1.1\r\nContent-Type: text/plain\r\nApi-Key: wrong-key";
        let resp = handle_notify(&gateway, headers, b"hi").await;
        assert!(resp.starts_with("HTTP/1.1 401"));

        let headers = "POST / HTTP/1.1\r\nContent-Type: text/plain\r\nApi-Key: right-key";
        let resp = handle_notify(&gateway, headers, b"hi").await;
        assert!(resp.starts_with("HTTP/1.1 200"));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notify_multipart_message_field() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), None).await;

        let headers =
            "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=XX";
        let body =
            b"--XX\r\nContent-Disposition: form-data; name=\"Message\"\r\n\r\ndisk full\r\n--XX--";
        let resp = handle_notify(&gateway, headers, body).await;

        assert!(resp.starts_with("HTTP/1.1 200"));
        assert_eq!(
            mock.sent_events()[0].content["body"].as_str().unwrap(),
            "disk full"
        );
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notify_media_requires_file_name() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), None).await;

        let headers = "POST / HTTP/1.1\r\nContent-Type: application/pdf";
        let resp = handle_notify(&gateway, headers, &[1, 2, 3]).await;

        assert!(resp.starts_with("HTTP/1.1 400"));
        assert!(resp.contains("File-Name"));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notify_media_delivered() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), None).await;

        let headers = "POST / HTTP/1.1\r\nContent-Type: application/pdf\r\nFile-Name: report.pdf\r\nSend-To: @alice:example.org";
        let resp = handle_notify(&gateway, headers, &[0x25, 0x50, 0x44, 0x46]).await;

        assert!(resp.starts_with("HTTP/1.1 200"));
        assert_eq!(mock.upload_calls(), 1);
        assert_eq!(
            mock.sent_events()[0].content["msgtype"].as_str().unwrap(),
            "m.file"
        );
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notify_empty_body_rejected() {
        let mock = Arc::new(MockTransport::new());
        let (gateway, _dir) = test_gateway(mock.clone(), None).await;

        let headers = "POST / HTTP/1.1\r\nContent-Type: text/plain";
        let resp = handle_notify(&gateway, headers, b"").await;
        assert!(resp.starts_with("HTTP/1.1 400"));
        gateway.stop().await;
    }

    #[test]
    fn test_validate_media_image_mismatch() {
        assert!(validate_media("shot.png", "application/octet-stream").is_err());
        assert!(validate_media("shot.png", "image/png").is_ok());
        assert!(validate_media("notes.txt", "text/csv").is_ok());
        assert!(validate_media("noextension", "application/pdf").is_err());
    }
}
