//! The central bus: a live fan-out channel from the Scan Executor to
//! Session Broker viewer sessions.
//!
//! Resolves the Controller/Executor/Broker cyclic reference by being an
//! independently-lived component all three hold a reference to, rather
//! than any of them holding back-pointers to the others. Built on
//! `tokio::sync::broadcast`, whose per-subscriber bounded buffer and
//! "overflow drops only that subscriber" semantics are exactly the
//! ordering and backpressure guarantees the bus needs: cache writes are
//! never gated on a slow viewer, and a lagging session loses only its own
//! place in the stream, never the publisher.

use tokio::sync::broadcast;

use crate::model::{SubtileKey, SubtileRecord};

#[derive(Debug, Clone)]
pub struct TileResult {
    pub key: SubtileKey,
    pub record: SubtileRecord,
}

/// Multi-producer, multi-consumer bounded channel of `TileResult`s.
/// Publishing never blocks the caller: it is the only way the bus keeps
/// cache writes from ever waiting on a slow viewer.
pub struct Bus {
    sender: broadcast::Sender<TileResult>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes a result. Returns the number of subscribers it was
    /// delivered to; `0` is not an error — it just means no one is
    /// listening right now (the cache write already happened).
    pub fn publish(&self, result: TileResult) -> usize {
        self.sender.send(result).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TileResult> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_result() -> TileResult {
        TileResult {
            key: SubtileKey {
                task_id: Uuid::now_v7(),
                level: 0,
                tile_row: 0,
                tile_col: 0,
                sub_row: 0,
                sub_col: 0,
            },
            record: SubtileRecord {
                level: 0,
                subtiles_per_side: 1,
                coarse_row: 0,
                coarse_col: 0,
                sub_row: 0,
                sub_col: 0,
                center_lat: 0.0,
                center_lon: 0.0,
                elevation: Some(1.0),
                source: Source::Real,
                sampled_at: Utc::now(),
                attempts: 1,
            },
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = Bus::new(16);
        assert_eq!(bus.publish(sample_result()), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = Bus::new(16);
        let mut receiver = bus.subscribe();
        bus.publish(sample_result());
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.key.tile_row, 0);
    }

    #[tokio::test]
    async fn one_lagging_subscriber_does_not_block_publish_or_other_subscribers() {
        let bus = Bus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for _ in 0..10 {
            bus.publish(sample_result());
        }

        // Fast subscriber drains promptly and sees at least the most recent message.
        assert!(fast.recv().await.is_ok());

        // Slow subscriber, having missed messages, observes a Lagged error rather
        // than blocking the bus.
        let result = slow.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
