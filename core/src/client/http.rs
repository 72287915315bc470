//! HTTP transport
//!
//! Production [`Transport`] implementation speaking the messaging
//! network's client-server API over HTTP+JSON. Every call carries the
//! configured bounded timeout; the sync long-poll gets its own, longer
//! deadline on top of the server-side timeout.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::trace;

use crate::gateway::{ChannelId, MessageId};

use super::transport::{
    ContentUri, InviteEvent, LoginSession, SyncBatch, Transport, TransportError,
};

/// Extra client-side allowance on top of the server-side sync timeout.
const SYNC_DEADLINE_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    device_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct WhoamiResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

/// HTTP+JSON transport over the client-server API
pub struct HttpTransport {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport against the given homeserver base URL.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let base = base_url.trim().trim_end_matches('/');
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(TransportError::Malformed(format!(
                "invalid homeserver url: {}",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent("courier-gateway/0.1")
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base.to_string(),
            http,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_request_error(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(e.to_string())
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = resp.status();
        let body = resp.bytes().await.map_err(Self::map_request_error)?;

        if !status.is_success() {
            let parsed: ApiErrorBody = serde_json::from_slice(&body).unwrap_or(ApiErrorBody {
                errcode: String::new(),
                error: String::from_utf8_lossy(&body).into_owned(),
                retry_after_ms: None,
            });
            // The server names rate limiting both by status and by errcode
            if status.as_u16() == 429 || parsed.errcode == "M_LIMIT_EXCEEDED" {
                return Err(TransportError::RateLimited {
                    retry_after_ms: parsed.retry_after_ms,
                });
            }
            return Err(TransportError::Api {
                status: status.as_u16(),
                code: parsed.errcode,
                message: parsed.error,
            });
        }

        serde_json::from_slice(&body).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Percent-encode a path component (channel ids carry `!` and `:`).
pub(crate) fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn login(
        &self,
        user_id: &str,
        password: &str,
        device_name: &str,
    ) -> Result<LoginSession, TransportError> {
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": user_id },
            "password": password,
            "initial_device_display_name": device_name,
        });

        let resp = self
            .http
            .post(self.url("/_matrix/client/v3/login"))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let login: LoginResponse = Self::handle_response(resp).await?;
        Ok(LoginSession {
            user_id: login.user_id,
            device_id: login.device_id,
            access_token: login.access_token,
        })
    }

    async fn whoami(&self, access_token: &str) -> Result<String, TransportError> {
        let resp = self
            .http
            .get(self.url("/_matrix/client/v3/account/whoami"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let whoami: WhoamiResponse = Self::handle_response(resp).await?;
        Ok(whoami.user_id)
    }

    async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout_ms: u64,
    ) -> Result<SyncBatch, TransportError> {
        let mut query: Vec<(&str, String)> = vec![("timeout", timeout_ms.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let resp = self
            .http
            .get(self.url("/_matrix/client/v3/sync"))
            .query(&query)
            .bearer_auth(access_token)
            // the long poll must outlive the per-call default
            .timeout(Duration::from_millis(timeout_ms) + SYNC_DEADLINE_MARGIN + self.request_timeout)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let value: serde_json::Value = Self::handle_response(resp).await?;
        parse_sync_batch(&value)
    }

    async fn create_private_channel(
        &self,
        access_token: &str,
        invitee: &str,
        name: &str,
    ) -> Result<ChannelId, TransportError> {
        let body = json!({
            "visibility": "private",
            "preset": "private_chat",
            "is_direct": true,
            "name": name,
            "invite": [invitee],
            "initial_state": [{
                "type": "m.room.power_levels",
                "content": { "users": { invitee: 100 } },
            }],
        });

        let resp = self
            .http
            .post(self.url("/_matrix/client/v3/createRoom"))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let created: CreateRoomResponse = Self::handle_response(resp).await?;
        trace!(channel = %created.room_id, invitee = %invitee, "created private channel");
        Ok(ChannelId::new(created.room_id))
    }

    async fn join_channel(
        &self,
        access_token: &str,
        channel: &ChannelId,
    ) -> Result<(), TransportError> {
        let path = format!(
            "/_matrix/client/v3/join/{}",
            encode_component(channel.as_str())
        );
        let resp = self
            .http
            .post(self.url(&path))
            .bearer_auth(access_token)
            .json(&json!({}))
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let _: serde_json::Value = Self::handle_response(resp).await?;
        Ok(())
    }

    async fn send_event(
        &self,
        access_token: &str,
        channel: &ChannelId,
        txn_id: &str,
        content: &serde_json::Value,
    ) -> Result<MessageId, TransportError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            encode_component(channel.as_str()),
            encode_component(txn_id)
        );
        let resp = self
            .http
            .put(self.url(&path))
            .bearer_auth(access_token)
            .json(content)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let sent: SendResponse = Self::handle_response(resp).await?;
        Ok(MessageId::new(sent.event_id))
    }

    async fn upload_media(
        &self,
        access_token: &str,
        bytes: &[u8],
        content_type: &str,
        filename: &str,
    ) -> Result<ContentUri, TransportError> {
        let resp = self
            .http
            .post(self.url("/_matrix/media/v3/upload"))
            .query(&[("filename", filename)])
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let uploaded: UploadResponse = Self::handle_response(resp).await?;
        Ok(ContentUri(uploaded.content_uri))
    }
}

/// Pull invites, encryption notices, and the cursor out of a sync response.
fn parse_sync_batch(value: &serde_json::Value) -> Result<SyncBatch, TransportError> {
    let next_batch = value
        .get("next_batch")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TransportError::Malformed("sync response without next_batch".to_string()))?
        .to_string();

    let mut invites = Vec::new();
    if let Some(invite_rooms) = value
        .get("rooms")
        .and_then(|r| r.get("invite"))
        .and_then(|v| v.as_object())
    {
        for (channel, room) in invite_rooms {
            let sender = room
                .get("invite_state")
                .and_then(|s| s.get("events"))
                .and_then(|e| e.as_array())
                .and_then(|events| {
                    events.iter().find(|ev| {
                        ev.get("type").and_then(|t| t.as_str()) == Some("m.room.member")
                            && ev
                                .get("content")
                                .and_then(|c| c.get("membership"))
                                .and_then(|m| m.as_str())
                                == Some("invite")
                    })
                })
                .and_then(|ev| ev.get("sender"))
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            invites.push(InviteEvent {
                channel: ChannelId::new(channel.clone()),
                sender,
            });
        }
    }

    let mut encryption_enabled = Vec::new();
    if let Some(joined_rooms) = value
        .get("rooms")
        .and_then(|r| r.get("join"))
        .and_then(|v| v.as_object())
    {
        for (channel, room) in joined_rooms {
            let sections = ["state", "timeline"];
            let has_encryption = sections.iter().any(|section| {
                room.get(section)
                    .and_then(|s| s.get("events"))
                    .and_then(|e| e.as_array())
                    .map(|events| {
                        events.iter().any(|ev| {
                            ev.get("type").and_then(|t| t.as_str()) == Some("m.room.encryption")
                        })
                    })
                    .unwrap_or(false)
            });
            if has_encryption {
                encryption_enabled.push(ChannelId::new(channel.clone()));
            }
        }
    }

    Ok(SyncBatch {
        next_batch,
        invites,
        encryption_enabled,
    })
}
