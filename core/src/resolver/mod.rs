//! Recipient resolver / channel cache
//!
//! Maps a user identity to its private delivery channel. Cache hits
//! return immediately; a miss triggers one channel-creation call no
//! matter how many resolves race for the same user (single-flight:
//! later callers wait on the first flight and read its result).
//!
//! Entries are never evicted on success. A fatal delivery failure that
//! marks the channel stale invalidates the entry so the next resolve
//! re-creates it. Mappings are written through to the session database
//! and warm-loaded on startup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::{MatrixClient, ResolveError};
use crate::data::{load_channels, remove_channel, set_channel_encrypted, upsert_channel};
use crate::gateway::{current_timestamp, ChannelId};

/// One cached recipient -> channel entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub channel: ChannelId,
    pub encrypted: bool,
    pub verified_at: i64,
}

/// The channel cache
pub struct ChannelCache {
    /// user id -> cached entry
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// Arena of per-user creation locks; created on demand, never
    /// removed (bounded by the number of distinct recipients contacted)
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for ChannelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Warm the cache from the session database.
    pub async fn warm_from_db(&self, client: &MatrixClient) {
        let records = {
            let conn = client.db().lock().await;
            match load_channels(&conn) {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "failed to load channel cache from database");
                    return;
                }
            }
        };

        if records.is_empty() {
            return;
        }

        let mut entries = self.entries.write().await;
        for record in &records {
            entries.insert(
                record.user_id.clone(),
                CacheEntry {
                    channel: ChannelId::new(record.channel_id.clone()),
                    encrypted: record.encrypted,
                    verified_at: record.verified_at,
                },
            );
        }
        info!(count = records.len(), "channel cache warmed from database");
    }

    /// Resolve a user to its private channel, creating one on first
    /// contact. Concurrent calls for the same user collapse into one
    /// creation call.
    pub async fn resolve(
        &self,
        client: &MatrixClient,
        user_id: &str,
    ) -> Result<ChannelId, ResolveError> {
        if let Some(entry) = self.get(user_id).await {
            return Ok(entry.channel);
        }

        let flight = self.flight_lock(user_id).await;
        let _guard = flight.lock().await;

        // The first flight may have populated the cache while we waited
        if let Some(entry) = self.get(user_id).await {
            debug!(user_id = %user_id, "channel resolved by concurrent flight");
            return Ok(entry.channel);
        }

        let channel = client.create_private_channel(user_id).await?;
        self.insert(client, user_id, channel.clone(), false).await;
        Ok(channel)
    }

    /// Look up a cached entry.
    pub async fn get(&self, user_id: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(user_id).cloned()
    }

    /// Insert an entry and write it through to the database.
    pub async fn insert(
        &self,
        client: &MatrixClient,
        user_id: &str,
        channel: ChannelId,
        encrypted: bool,
    ) {
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                user_id.to_string(),
                CacheEntry {
                    channel: channel.clone(),
                    encrypted,
                    verified_at: current_timestamp(),
                },
            );
        }
        let conn = client.db().lock().await;
        if let Err(e) = upsert_channel(&conn, user_id, channel.as_str(), encrypted) {
            warn!(user_id = %user_id, error = %e, "failed to persist channel cache entry");
        }
    }

    /// Invalidate whichever entry points at a stale channel.
    ///
    /// Called when a delivery fails fatally with a channel-gone
    /// classification; the next resolve for that user re-creates.
    pub async fn invalidate_channel(&self, client: &MatrixClient, channel: &ChannelId) {
        let user_id = {
            let mut entries = self.entries.write().await;
            let user_id = entries
                .iter()
                .find(|(_, entry)| &entry.channel == channel)
                .map(|(user, _)| user.clone());
            if let Some(ref user) = user_id {
                entries.remove(user);
            }
            user_id
        };

        if let Some(user_id) = user_id {
            info!(user_id = %user_id, channel = %channel, "invalidated stale channel");
            let conn = client.db().lock().await;
            if let Err(e) = remove_channel(&conn, &user_id) {
                warn!(user_id = %user_id, error = %e, "failed to remove stale channel entry");
            }
        }
    }

    /// Record that a channel announced encryption being enabled.
    pub async fn mark_encrypted(&self, client: &MatrixClient, channel: &ChannelId) {
        {
            let mut entries = self.entries.write().await;
            for entry in entries.values_mut() {
                if &entry.channel == channel {
                    entry.encrypted = true;
                }
            }
        }
        let conn = client.db().lock().await;
        if let Err(e) = set_channel_encrypted(&conn, channel.as_str()) {
            warn!(channel = %channel, error = %e, "failed to persist encryption flag");
        }
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn flight_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MatrixClient;
    use crate::gateway::GatewayConfig;
    use crate::testing::MockTransport;

    use rusqlite::Connection;
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    async fn test_client(mock: Arc<MockTransport>) -> Arc<MatrixClient> {
        let conn = Connection::open_in_memory().unwrap();
        crate::data::create_all_tables(&conn).unwrap();
        let db = Arc::new(TokioMutex::new(conn));
        let config = GatewayConfig::for_testing();
        Arc::new(
            MatrixClient::connect(mock, db, &config)
                .await
                .expect("mock connect"),
        )
    }

    #[tokio::test]
    async fn test_resolve_hits_cache_after_first_create() {
        let mock = Arc::new(MockTransport::new());
        let client = test_client(mock.clone()).await;
        let cache = ChannelCache::new();

        let first = cache.resolve(&client, "@alice:example.org").await.unwrap();
        let second = cache.resolve(&client, "@alice:example.org").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.create_calls(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_single_flight() {
        let mock = Arc::new(MockTransport::new());
        mock.set_create_delay(Duration::from_millis(50));
        let client = test_client(mock.clone()).await;
        let cache = Arc::new(ChannelCache::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                cache.resolve(&client, "@alice:example.org").await
            }));
        }

        let mut channels = Vec::new();
        for handle in handles {
            channels.push(handle.await.unwrap().unwrap());
        }

        // Exactly one creation call; every caller got the same channel
        assert_eq!(mock.create_calls(), 1);
        assert!(channels.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_distinct_users_get_distinct_channels() {
        let mock = Arc::new(MockTransport::new());
        let client = test_client(mock.clone()).await;
        let cache = ChannelCache::new();

        let a = cache.resolve(&client, "@a:example.org").await.unwrap();
        let b = cache.resolve(&client, "@b:example.org").await.unwrap();

        assert_ne!(a, b);
        assert_eq!(mock.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_then_recreate() {
        let mock = Arc::new(MockTransport::new());
        let client = test_client(mock.clone()).await;
        let cache = ChannelCache::new();

        let first = cache.resolve(&client, "@alice:example.org").await.unwrap();
        cache.invalidate_channel(&client, &first).await;
        assert!(cache.get("@alice:example.org").await.is_none());

        let second = cache.resolve(&client, "@alice:example.org").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(mock.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_write_through_persists_entries() {
        let mock = Arc::new(MockTransport::new());
        let client = test_client(mock.clone()).await;
        let cache = ChannelCache::new();

        let channel = cache.resolve(&client, "@alice:example.org").await.unwrap();

        let conn = client.db().lock().await;
        let records = crate::data::load_channels(&conn).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "@alice:example.org");
        assert_eq!(records[0].channel_id, channel.as_str());
    }

    #[tokio::test]
    async fn test_warm_from_db() {
        let mock = Arc::new(MockTransport::new());
        let client = test_client(mock.clone()).await;

        {
            let conn = client.db().lock().await;
            crate::data::upsert_channel(&conn, "@old:example.org", "!dm:example.org", true)
                .unwrap();
        }

        let cache = ChannelCache::new();
        cache.warm_from_db(&client).await;

        let entry = cache.get("@old:example.org").await.unwrap();
        assert_eq!(entry.channel.as_str(), "!dm:example.org");
        assert!(entry.encrypted);

        // Warm entry short-circuits creation entirely
        let resolved = cache.resolve(&client, "@old:example.org").await.unwrap();
        assert_eq!(resolved.as_str(), "!dm:example.org");
        assert_eq!(mock.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_mark_encrypted_updates_entry() {
        let mock = Arc::new(MockTransport::new());
        let client = test_client(mock.clone()).await;
        let cache = ChannelCache::new();

        let channel = cache.resolve(&client, "@alice:example.org").await.unwrap();
        assert!(!cache.get("@alice:example.org").await.unwrap().encrypted);

        cache.mark_encrypted(&client, &channel).await;
        assert!(cache.get("@alice:example.org").await.unwrap().encrypted);
    }

    #[tokio::test]
    async fn test_recipient_unknown_not_cached() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_create_with_unknown_user();
        let client = test_client(mock.clone()).await;
        let cache = ChannelCache::new();

        let err = cache
            .resolve(&client, "@ghost:example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::RecipientUnknown(_)));
        assert!(cache.is_empty().await);
    }
}
