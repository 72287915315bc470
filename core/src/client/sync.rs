//! Background synchronization
//!
//! Two long-lived tasks:
//! - the sync loop continuously drains the network's synchronization
//!   stream, never blocking on delivery work; it only advances session
//!   state and produces events
//! - the event consumer drains the bounded event stream in order,
//!   accepting invites and recording channel encryption flags
//!
//! Back-pressure: the event channel is bounded, so a slow consumer
//! slows the producer instead of growing memory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::gateway::ChannelId;
use crate::resolver::ChannelCache;

use super::transport::InviteEvent;
use super::MatrixClient;

/// Pause after a failed sync poll before trying again
const SYNC_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Events produced by the sync loop for the consumer task
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The account was invited to a channel
    InviteReceived(InviteEvent),
    /// A channel announced encryption being enabled
    EncryptionEnabled(ChannelId),
}

/// Run the continuous sync loop until shutdown.
pub async fn run_sync_loop(
    client: Arc<MatrixClient>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = tokio::select! {
            result = client.sync_once() => result,
            changed = shutdown.changed() => {
                // a closed shutdown channel means the gateway is gone
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match batch {
            Ok(batch) => {
                for invite in batch.invites {
                    debug!(
                        channel = %invite.channel,
                        sender = %invite.sender,
                        "invite received"
                    );
                    if event_tx
                        .send(ClientEvent::InviteReceived(invite))
                        .await
                        .is_err()
                    {
                        debug!("event consumer gone, stopping sync loop");
                        return;
                    }
                }
                for channel in batch.encryption_enabled {
                    if event_tx
                        .send(ClientEvent::EncryptionEnabled(channel))
                        .await
                        .is_err()
                    {
                        debug!("event consumer gone, stopping sync loop");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "sync poll failed");
                tokio::select! {
                    _ = tokio::time::sleep(SYNC_ERROR_DELAY) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    info!("sync loop stopped");
}

/// Drain the event stream in order until shutdown.
pub async fn run_event_consumer(
    client: Arc<MatrixClient>,
    cache: Arc<ChannelCache>,
    mut event_rx: mpsc::Receiver<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match event {
            ClientEvent::InviteReceived(invite) => {
                if let Err(e) = client.accept_invite(&invite.channel).await {
                    warn!(
                        channel = %invite.channel,
                        error = %e,
                        "unable to accept invite"
                    );
                }
            }
            ClientEvent::EncryptionEnabled(channel) => {
                debug!(channel = %channel, "encryption enabled");
                cache.mark_encrypted(&client, &channel).await;
            }
        }
    }

    info!("event consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::SyncBatch;
    use crate::gateway::GatewayConfig;
    use crate::testing::MockTransport;

    use rusqlite::Connection;
    use tokio::sync::Mutex as TokioMutex;

    async fn test_client(mock: Arc<MockTransport>) -> Arc<MatrixClient> {
        let conn = Connection::open_in_memory().unwrap();
        crate::data::create_all_tables(&conn).unwrap();
        let db = Arc::new(TokioMutex::new(conn));
        let config = GatewayConfig::for_testing();
        Arc::new(MatrixClient::connect(mock, db, &config).await.unwrap())
    }

    #[tokio::test]
    async fn test_sync_loop_accepts_invites() {
        let mock = Arc::new(MockTransport::new());
        mock.push_sync_batch(SyncBatch {
            next_batch: "s1".to_string(),
            invites: vec![InviteEvent {
                channel: ChannelId::new("!invited:example.org"),
                sender: "@alice:example.org".to_string(),
            }],
            encryption_enabled: vec![],
        });

        let client = test_client(mock.clone()).await;
        let cache = Arc::new(ChannelCache::new());
        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sync_task = tokio::spawn(run_sync_loop(
            client.clone(),
            event_tx,
            shutdown_rx.clone(),
        ));
        let consumer_task = tokio::spawn(run_event_consumer(
            client.clone(),
            cache,
            event_rx,
            shutdown_rx,
        ));

        // Wait for the invite to be processed
        tokio::time::timeout(Duration::from_secs(2), async {
            while mock.join_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("invite was never accepted");

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), sync_task).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), consumer_task).await;

        assert!(mock.joined_channels().contains(&"!invited:example.org".to_string()));
    }

    #[tokio::test]
    async fn test_sync_advances_and_persists_cursor() {
        let mock = Arc::new(MockTransport::new());
        mock.push_sync_batch(SyncBatch {
            next_batch: "s42".to_string(),
            invites: vec![],
            encryption_enabled: vec![],
        });

        let client = test_client(mock.clone()).await;
        client.sync_once().await.unwrap();

        let conn = client.db().lock().await;
        let stored = crate::data::load_session(&conn).unwrap().unwrap();
        assert_eq!(stored.since, Some("s42".to_string()));
    }

    #[tokio::test]
    async fn test_encryption_event_marks_cache() {
        let mock = Arc::new(MockTransport::new());
        let client = test_client(mock.clone()).await;
        let cache = Arc::new(ChannelCache::new());

        let channel = cache.resolve(&client, "@alice:example.org").await.unwrap();

        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = tokio::spawn(run_event_consumer(
            client.clone(),
            cache.clone(),
            event_rx,
            shutdown_rx,
        ));

        event_tx
            .send(ClientEvent::EncryptionEnabled(channel))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if cache.get("@alice:example.org").await.unwrap().encrypted {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("encryption flag never set");

        shutdown_tx.send(true).unwrap();
        drop(event_tx);
        let _ = tokio::time::timeout(Duration::from_secs(2), consumer).await;
    }
}
