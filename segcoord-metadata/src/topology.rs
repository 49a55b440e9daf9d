//! Topology store
//!
//! Durable truth of what should exist: loaded collections and the replicas
//! that serve them. Entries are created and removed by load/release
//! operations outside the checker; the checker only reads.

use parking_lot::RwLock;
use segcoord_core::{
    Collection, CollectionId, CollectionStatus, NodeId, PartitionId, Replica, ReplicaId, Result,
    SegcoordError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Loaded collections
#[derive(Default)]
pub struct CollectionManager {
    collections: RwLock<HashMap<CollectionId, Arc<Collection>>>,
}

impl CollectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_collection(&self, collection: Collection) {
        debug!(collection_id = collection.id, "Put collection");
        self.collections
            .write()
            .insert(collection.id, Arc::new(collection));
    }

    pub fn remove_collection(&self, collection_id: CollectionId) -> Option<Arc<Collection>> {
        self.collections.write().remove(&collection_id)
    }

    pub fn get(&self, collection_id: CollectionId) -> Option<Arc<Collection>> {
        self.collections.read().get(&collection_id).cloned()
    }

    pub fn contains(&self, collection_id: CollectionId) -> bool {
        self.collections.read().contains_key(&collection_id)
    }

    /// All loaded collection ids, ascending
    pub fn get_all(&self) -> Vec<CollectionId> {
        let mut ids: Vec<_> = self.collections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get_partitions(&self, collection_id: CollectionId) -> Vec<PartitionId> {
        self.get(collection_id)
            .map(|c| c.partitions.clone())
            .unwrap_or_default()
    }

    pub fn update_status(
        &self,
        collection_id: CollectionId,
        status: CollectionStatus,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let current = collections
            .get(&collection_id)
            .ok_or(SegcoordError::CollectionNotFound(collection_id))?;

        let mut updated = (**current).clone();
        updated.status = status;
        collections.insert(collection_id, Arc::new(updated));
        Ok(())
    }
}

/// Replicas, keyed by replica id
#[derive(Default)]
pub struct ReplicaManager {
    replicas: RwLock<HashMap<ReplicaId, Arc<Replica>>>,
}

impl ReplicaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, replica: Replica) {
        debug!(
            replica_id = replica.id,
            collection_id = replica.collection_id,
            nodes = ?replica.nodes,
            "Put replica"
        );
        self.replicas.write().insert(replica.id, Arc::new(replica));
    }

    pub fn get(&self, replica_id: ReplicaId) -> Option<Arc<Replica>> {
        self.replicas.read().get(&replica_id).cloned()
    }

    /// Replicas of a collection, ascending by replica id
    pub fn get_by_collection(&self, collection_id: CollectionId) -> Vec<Arc<Replica>> {
        let mut replicas: Vec<_> = self
            .replicas
            .read()
            .values()
            .filter(|r| r.collection_id == collection_id)
            .cloned()
            .collect();
        replicas.sort_by_key(|r| r.id);
        replicas
    }

    pub fn get_by_collection_and_node(
        &self,
        collection_id: CollectionId,
        node_id: NodeId,
    ) -> Option<Arc<Replica>> {
        self.get_by_collection(collection_id)
            .into_iter()
            .find(|r| r.contains(node_id))
    }

    pub fn get_by_node(&self, node_id: NodeId) -> Vec<Arc<Replica>> {
        let mut replicas: Vec<_> = self
            .replicas
            .read()
            .values()
            .filter(|r| r.contains(node_id))
            .cloned()
            .collect();
        replicas.sort_by_key(|r| r.id);
        replicas
    }

    /// Drop every replica of a collection, returning their ids
    pub fn remove_collection(&self, collection_id: CollectionId) -> Vec<ReplicaId> {
        let mut replicas = self.replicas.write();
        let mut removed: Vec<_> = replicas
            .values()
            .filter(|r| r.collection_id == collection_id)
            .map(|r| r.id)
            .collect();
        for id in &removed {
            replicas.remove(id);
        }
        removed.sort_unstable();
        removed
    }

    pub fn add_node(&self, replica_id: ReplicaId, node_id: NodeId) -> Result<()> {
        self.modify_nodes(replica_id, |r| {
            r.nodes.insert(node_id);
        })
    }

    pub fn remove_node(&self, replica_id: ReplicaId, node_id: NodeId) -> Result<()> {
        self.modify_nodes(replica_id, |r| {
            r.nodes.remove(&node_id);
        })
    }

    fn modify_nodes<F: FnOnce(&mut Replica)>(&self, replica_id: ReplicaId, f: F) -> Result<()> {
        let mut replicas = self.replicas.write();
        let current = replicas
            .get(&replica_id)
            .ok_or(SegcoordError::ReplicaNotFound(replica_id))?;

        let mut updated = (**current).clone();
        f(&mut updated);
        replicas.insert(replica_id, Arc::new(updated));
        Ok(())
    }
}

/// Collections plus replicas
#[derive(Default)]
pub struct TopologyStore {
    pub collections: CollectionManager,
    pub replicas: ReplicaManager,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection together with its replicas
    pub fn load_collection(&self, collection: Collection, replicas: Vec<Replica>) -> Result<()> {
        for replica in &replicas {
            if replica.collection_id != collection.id {
                return Err(SegcoordError::ReplicaCollectionMismatch {
                    replica: replica.id,
                    expected: collection.id,
                    actual: replica.collection_id,
                });
            }
        }

        info!(
            collection_id = collection.id,
            replicas = replicas.len(),
            "Loading collection"
        );

        self.collections.put_collection(collection);
        for replica in replicas {
            self.replicas.put(replica);
        }
        Ok(())
    }

    /// Forget a collection and its replicas
    pub fn release_collection(&self, collection_id: CollectionId) -> bool {
        let removed = self.collections.remove_collection(collection_id).is_some();
        let replicas = self.replicas.remove_collection(collection_id);
        info!(collection_id, ?replicas, "Released collection");
        removed
    }
}
