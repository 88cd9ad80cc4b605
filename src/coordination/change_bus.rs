use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Channel name prefix; one channel per database name, per origin.
pub const CHANNEL_PREFIX: &str = "absurder-sql:";

/// What kind of mutation a change event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Schema,
    Data,
    SnapshotReplaced,
}

/// Cross-tab notification that a database advanced to a new generation.
///
/// Delivery is best-effort and may duplicate; receivers are expected to
/// act on generation advancement, which makes duplicates harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub database_name: String,
    pub generation: u64,
    pub change_type: ChangeType,
    pub origin_leader_id: u128,
}

struct Peer {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

lazy_static! {
    // The in-process equivalent of the origin-wide broadcast channel.
    // Keyed by full channel name; cross-origin delivery is impossible by
    // construction because the registry never leaves the process.
    static ref CHANNELS: Mutex<HashMap<String, Vec<Peer>>> = Mutex::new(HashMap::new());
    static ref NEXT_PEER_ID: Mutex<u64> = Mutex::new(1);
}

pub fn channel_name(db_name: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, db_name)
}

/// Publish an event to every peer subscribed to the database's channel.
///
/// The payload crosses the channel as JSON, the same shape it would have
/// on a real host bus. Publishing never blocks: sends are unbounded and
/// peers whose receiving side is gone are dropped on the spot.
pub fn publish(event: &ChangeEvent) {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            log::error!("change event for {:?} did not serialize: {}", event.database_name, err);
            return;
        }
    };
    let channel = channel_name(&event.database_name);
    let mut channels = CHANNELS.lock().unwrap();
    if let Some(peers) = channels.get_mut(&channel) {
        peers.retain(|peer| peer.tx.send(payload.clone()).is_ok());
        log::debug!(
            "published generation {} on {:?} to {} peers",
            event.generation,
            channel,
            peers.len()
        );
        if peers.is_empty() {
            channels.remove(&channel);
        }
    }
}

/// Active subscription handle. Dropping it detaches the callback.
pub struct Subscription {
    channel: String,
    peer_id: u64,
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = CHANNELS.lock().unwrap();
        if let Some(peers) = channels.get_mut(&self.channel) {
            peers.retain(|peer| peer.id != self.peer_id);
            if peers.is_empty() {
                channels.remove(&self.channel);
            }
        }
        self.task.abort();
    }
}

/// Subscribe a callback to a database's change channel. Events arrive on
/// a background task, strictly in the order they were published.
pub fn subscribe<F>(db_name: &str, callback: F) -> Subscription
where
    F: Fn(ChangeEvent) + Send + 'static,
{
    let channel = channel_name(db_name);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let peer_id = {
        let mut next = NEXT_PEER_ID.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    };
    CHANNELS
        .lock()
        .unwrap()
        .entry(channel.clone())
        .or_insert_with(Vec::new)
        .push(Peer { id: peer_id, tx });

    let task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            match serde_json::from_str::<ChangeEvent>(&payload) {
                Ok(event) => callback(event),
                Err(err) => log::warn!("dropping undecodable change event: {}", err),
            }
        }
    });

    Subscription { channel, peer_id, task }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn event(db: &str, generation: u64) -> ChangeEvent {
        ChangeEvent {
            database_name: db.to_string(),
            generation,
            change_type: ChangeType::Data,
            origin_leader_id: 7,
        }
    }

    #[tokio::test]
    async fn events_reach_subscribers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = subscribe("bus-order", move |e| {
            seen2.lock().unwrap().push(e.generation);
        });
        for generation in 1..=5 {
            publish(&event("bus-order", generation));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn channels_are_isolated_per_database() {
        let count = Arc::new(AtomicU64::new(0));
        let count2 = count.clone();
        let _sub = subscribe("bus-iso-a", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        publish(&event("bus-iso-b", 1));
        publish(&event("bus-iso-a", 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_subscription_detaches() {
        let count = Arc::new(AtomicU64::new(0));
        let count2 = count.clone();
        let sub = subscribe("bus-drop", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        publish(&event("bus-drop", 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sub);
        publish(&event("bus-drop", 2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wire_payload_is_json() {
        let raw = serde_json::to_string(&event("bus-json", 3)).unwrap();
        assert!(raw.contains("\"generation\":3"));
        assert!(raw.contains("\"change_type\":\"data\""));
        let back: ChangeEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.generation, 3);
    }
}
