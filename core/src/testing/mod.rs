//! Testing utilities
//!
//! An in-process [`Transport`] implementation for exercising the
//! delivery engine without a real network. Failures are scripted per
//! call, every call is recorded, and sync batches can be fed in to
//! drive the sync loop.
//!
//! # Example
//!
//! ```ignore
//! let mock = Arc::new(MockTransport::new());
//! mock.fail_sends_to("!room:example.org", vec![TransportError::Timeout]);
//!
//! // ... run deliveries against the mock ...
//!
//! assert_eq!(mock.send_calls(), 2);
//! assert_eq!(mock.sent_to("!room:example.org").len(), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::transport::{
    ContentUri, LoginSession, SyncBatch, Transport, TransportError,
};
use crate::gateway::{ChannelId, MessageId};

/// Pause between empty sync polls so test loops don't spin
const IDLE_SYNC_DELAY: Duration = Duration::from_millis(10);

/// One recorded successful message send
#[derive(Debug, Clone)]
pub struct SentEvent {
    pub channel: String,
    pub txn_id: String,
    pub content: serde_json::Value,
}

#[derive(Default)]
struct MockState {
    login_calls: usize,
    create_calls: usize,
    create_errors: VecDeque<TransportError>,
    create_unknown_user: bool,
    next_channel: usize,
    join_calls: usize,
    joined: Vec<String>,
    send_calls: usize,
    send_attempts: Vec<(String, String)>,
    send_errors_by_channel: HashMap<String, VecDeque<TransportError>>,
    sent: Vec<SentEvent>,
    next_event: usize,
    upload_calls: usize,
    upload_errors: VecDeque<TransportError>,
    next_media: usize,
    sync_batches: VecDeque<SyncBatch>,
    sync_cursor: usize,
}

/// Scripted in-memory transport
pub struct MockTransport {
    state: Mutex<MockState>,
    create_delay: Mutex<Option<Duration>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            create_delay: Mutex::new(None),
        }
    }

    // ========== Scripting ==========

    /// Delay channel creation (to hold resolves in flight).
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next channel creations with the given errors, in order.
    pub fn fail_creates(&self, errors: Vec<TransportError>) {
        self.state.lock().unwrap().create_errors.extend(errors);
    }

    /// Make every channel creation fail as an unknown user.
    pub fn fail_create_with_unknown_user(&self) {
        self.state.lock().unwrap().create_unknown_user = true;
    }

    /// Fail the next sends into `channel` with the given errors, in order.
    pub fn fail_sends_to(&self, channel: &str, errors: Vec<TransportError>) {
        self.state
            .lock()
            .unwrap()
            .send_errors_by_channel
            .entry(channel.to_string())
            .or_default()
            .extend(errors);
    }

    /// Fail the next media uploads with the given errors, in order.
    pub fn fail_uploads(&self, errors: Vec<TransportError>) {
        self.state.lock().unwrap().upload_errors.extend(errors);
    }

    /// Queue a sync batch for the sync loop to pick up.
    pub fn push_sync_batch(&self, batch: SyncBatch) {
        self.state.lock().unwrap().sync_batches.push_back(batch);
    }

    // ========== Inspection ==========

    pub fn login_calls(&self) -> usize {
        self.state.lock().unwrap().login_calls
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn join_calls(&self) -> usize {
        self.state.lock().unwrap().join_calls
    }

    pub fn joined_channels(&self) -> Vec<String> {
        self.state.lock().unwrap().joined.clone()
    }

    /// Total send attempts, including failed ones.
    pub fn send_calls(&self) -> usize {
        self.state.lock().unwrap().send_calls
    }

    /// (channel, txn_id) of every send attempt, including failed ones.
    pub fn send_attempts(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().send_attempts.clone()
    }

    pub fn upload_calls(&self) -> usize {
        self.state.lock().unwrap().upload_calls
    }

    /// Successfully delivered events, in delivery order.
    pub fn sent_events(&self) -> Vec<SentEvent> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Successfully delivered events for one channel, in delivery order.
    pub fn sent_to(&self, channel: &str) -> Vec<SentEvent> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|e| e.channel == channel)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn login(
        &self,
        user_id: &str,
        _password: &str,
        _device_name: &str,
    ) -> Result<LoginSession, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.login_calls += 1;
        Ok(LoginSession {
            user_id: user_id.to_string(),
            device_id: "TESTDEVICE".to_string(),
            access_token: "mock-token".to_string(),
        })
    }

    async fn whoami(&self, _access_token: &str) -> Result<String, TransportError> {
        Ok("@courier:example.org".to_string())
    }

    async fn sync(
        &self,
        _access_token: &str,
        _since: Option<&str>,
        _timeout_ms: u64,
    ) -> Result<SyncBatch, TransportError> {
        let batch = {
            let mut state = self.state.lock().unwrap();
            match state.sync_batches.pop_front() {
                Some(batch) => Some(batch),
                None => {
                    state.sync_cursor += 1;
                    None
                }
            }
        };

        match batch {
            Some(batch) => Ok(batch),
            None => {
                // idle long-poll: nothing happened
                tokio::time::sleep(IDLE_SYNC_DELAY).await;
                let cursor = self.state.lock().unwrap().sync_cursor;
                Ok(SyncBatch {
                    next_batch: format!("s{}", cursor),
                    invites: vec![],
                    encryption_enabled: vec![],
                })
            }
        }
    }

    async fn create_private_channel(
        &self,
        _access_token: &str,
        invitee: &str,
        _name: &str,
    ) -> Result<ChannelId, TransportError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;

        if state.create_unknown_user {
            return Err(TransportError::Api {
                status: 404,
                code: "M_NOT_FOUND".to_string(),
                message: format!("user {} not found", invitee),
            });
        }
        if let Some(err) = state.create_errors.pop_front() {
            return Err(err);
        }

        state.next_channel += 1;
        Ok(ChannelId::new(format!(
            "!courier-{}:example.org",
            state.next_channel
        )))
    }

    async fn join_channel(
        &self,
        _access_token: &str,
        channel: &ChannelId,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.join_calls += 1;
        state.joined.push(channel.as_str().to_string());
        Ok(())
    }

    async fn send_event(
        &self,
        _access_token: &str,
        channel: &ChannelId,
        txn_id: &str,
        content: &serde_json::Value,
    ) -> Result<MessageId, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.send_calls += 1;
        state
            .send_attempts
            .push((channel.as_str().to_string(), txn_id.to_string()));

        if let Some(errors) = state.send_errors_by_channel.get_mut(channel.as_str()) {
            if let Some(err) = errors.pop_front() {
                return Err(err);
            }
        }

        state.next_event += 1;
        let event_id = format!("$event-{}", state.next_event);
        state.sent.push(SentEvent {
            channel: channel.as_str().to_string(),
            txn_id: txn_id.to_string(),
            content: content.clone(),
        });
        Ok(MessageId::new(event_id))
    }

    async fn upload_media(
        &self,
        _access_token: &str,
        _bytes: &[u8],
        _content_type: &str,
        _filename: &str,
    ) -> Result<ContentUri, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.upload_calls += 1;

        if let Some(err) = state.upload_errors.pop_front() {
            return Err(err);
        }

        state.next_media += 1;
        Ok(ContentUri(format!(
            "mxc://example.org/media-{}",
            state.next_media
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mock_records_sends() {
        let mock = MockTransport::new();
        let channel = ChannelId::new("!a:example.org");
        let content = serde_json::json!({ "msgtype": "m.notice", "body": "hi" });

        let id = mock
            .send_event("tok", &channel, "txn-1", &content)
            .await
            .unwrap();

        assert_eq!(id.as_str(), "$event-1");
        assert_eq!(mock.send_calls(), 1);
        assert_eq!(mock.sent_to("!a:example.org").len(), 1);
        assert!(mock.sent_to("!b:example.org").is_empty());
    }

    #[tokio::test]
    async fn test_scripted_send_failures_in_order() {
        let mock = MockTransport::new();
        let channel = ChannelId::new("!a:example.org");
        mock.fail_sends_to(
            "!a:example.org",
            vec![TransportError::Timeout, TransportError::Network("x".into())],
        );

        let content = serde_json::json!({ "body": "b" });
        assert!(matches!(
            mock.send_event("tok", &channel, "t1", &content).await,
            Err(TransportError::Timeout)
        ));
        assert!(matches!(
            mock.send_event("tok", &channel, "t2", &content).await,
            Err(TransportError::Network(_))
        ));
        assert!(mock.send_event("tok", &channel, "t3", &content).await.is_ok());
    }

    #[tokio::test]
    async fn test_failures_scoped_to_channel() {
        let mock = MockTransport::new();
        mock.fail_sends_to("!a:example.org", vec![TransportError::Timeout]);

        let content = serde_json::json!({ "body": "b" });
        let other = ChannelId::new("!b:example.org");
        assert!(mock.send_event("tok", &other, "t1", &content).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_produces_distinct_channels() {
        let mock = MockTransport::new();
        let a = mock
            .create_private_channel("tok", "@a:example.org", "n")
            .await
            .unwrap();
        let b = mock
            .create_private_channel("tok", "@b:example.org", "n")
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(mock.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_sync_drains_pushed_batches_first() {
        let mock = Arc::new(MockTransport::new());
        mock.push_sync_batch(SyncBatch {
            next_batch: "queued".to_string(),
            invites: vec![],
            encryption_enabled: vec![],
        });

        let first = mock.sync("tok", None, 0).await.unwrap();
        assert_eq!(first.next_batch, "queued");

        let second = mock.sync("tok", Some("queued"), 0).await.unwrap();
        assert!(second.next_batch.starts_with('s'));
    }

    #[tokio::test]
    async fn test_upload_failures_then_success() {
        let mock = MockTransport::new();
        mock.fail_uploads(vec![TransportError::Timeout]);

        assert!(matches!(
            mock.upload_media("tok", b"x", "image/png", "a.png").await,
            Err(TransportError::Timeout)
        ));
        let uri = mock
            .upload_media("tok", b"x", "image/png", "a.png")
            .await
            .unwrap();
        assert!(uri.0.starts_with("mxc://"));
        assert_eq!(mock.upload_calls(), 2);
    }
}
