//! Recovery-info collaborator
//!
//! The target manager learns the desired channels and sealed segments of a
//! partition from a [`Broker`]. The production broker talks to the data
//! coordinator; [`StaticBroker`] serves canned answers from memory.

use async_trait::async_trait;
use parking_lot::RwLock;
use segcoord_core::{CollectionId, PartitionId, SegmentInfo, VchannelInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Broker errors
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Recovery info unavailable: {0}")]
    Unavailable(String),

    #[error("Collection {0} not found")]
    CollectionNotFound(CollectionId),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Channels and sealed segments of one partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryInfo {
    pub channels: Vec<VchannelInfo>,
    pub segments: Vec<SegmentInfo>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_recovery_info(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Result<RecoveryInfo>;
}

/// In-memory broker
///
/// Unknown partitions report empty recovery info. `set_unavailable(true)`
/// makes every call fail until it is cleared.
#[derive(Default)]
pub struct StaticBroker {
    infos: RwLock<HashMap<(CollectionId, PartitionId), RecoveryInfo>>,
    unavailable: AtomicBool,
    latency: Option<Duration>,
}

impl StaticBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer, to exercise caller timeouts
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn set_recovery_info(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
        channels: Vec<VchannelInfo>,
        segments: Vec<SegmentInfo>,
    ) {
        self.infos.write().insert(
            (collection_id, partition_id),
            RecoveryInfo { channels, segments },
        );
    }

    pub fn remove_collection(&self, collection_id: CollectionId) {
        self.infos
            .write()
            .retain(|(collection, _), _| *collection != collection_id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for StaticBroker {
    async fn get_recovery_info(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Result<RecoveryInfo> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(format!(
                "static broker offline (collection {}, partition {})",
                collection_id, partition_id
            )));
        }

        let info = self
            .infos
            .read()
            .get(&(collection_id, partition_id))
            .cloned()
            .unwrap_or_default();

        debug!(
            collection_id,
            partition_id,
            channels = info.channels.len(),
            segments = info.segments.len(),
            "Served recovery info"
        );

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_broker_serves_canned_info() {
        let broker = StaticBroker::new();
        broker.set_recovery_info(
            1,
            10,
            vec![VchannelInfo::new(1, "ch-0")],
            vec![SegmentInfo::new(100, 1, 10, "ch-0")],
        );

        let info = broker.get_recovery_info(1, 10).await.unwrap();
        assert_eq!(info.channels.len(), 1);
        assert_eq!(info.segments[0].id, 100);

        let empty = broker.get_recovery_info(1, 11).await.unwrap();
        assert_eq!(empty, RecoveryInfo::default());
    }

    #[tokio::test]
    async fn test_static_broker_unavailable() {
        let broker = StaticBroker::new();
        broker.set_unavailable(true);
        let err = broker.get_recovery_info(1, 1).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));

        broker.set_unavailable(false);
        assert!(broker.get_recovery_info(1, 1).await.is_ok());
    }
}
