//! Partition ownership tables.
//!
//! Each namespace has one [`PartitionTable`] with a slot per partition. A slot
//! remembers the master node and a small ordered set of replicas. Slots are
//! locked individually, so the tender rewriting ownership and requests routing
//! through the table only contend on the partition they both touch.
//!
//! Every `Arc<Node>` stored in a slot is a strong reference; overwriting or
//! evicting it drops that reference.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::ReadPolicy;
use crate::node::Node;

#[derive(Default)]
struct Slot {
    master: Option<Arc<Node>>,
    replicas: VecDeque<Arc<Node>>,
    next_read: usize,
}

impl Slot {
    fn holds(&self, node: &Arc<Node>) -> bool {
        self.master.as_ref().is_some_and(|m| Arc::ptr_eq(m, node))
            || self.replicas.iter().any(|r| Arc::ptr_eq(r, node))
    }
}

/// Ownership of every partition of one namespace.
pub struct PartitionTable {
    namespace: String,
    slots: Box<[Mutex<Slot>]>,
    replica_capacity: usize,
}

impl PartitionTable {
    pub fn new(namespace: impl Into<String>, n_partitions: u32, replica_capacity: usize) -> Self {
        let slots = (0..n_partitions).map(|_| Mutex::new(Slot::default())).collect();
        Self {
            namespace: namespace.into(),
            slots,
            replica_capacity: replica_capacity.max(1),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn n_partitions(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Records `node` as the master (`is_write`) or a replica of `partition_id`.
    ///
    /// Returns whether the slot changed. Out-of-range ids are ignored.
    pub fn set(&self, node: &Arc<Node>, partition_id: u32, is_write: bool) -> bool {
        let Some(slot) = self.slots.get(partition_id as usize) else {
            debug!(namespace = %self.namespace, partition_id, "ignoring out-of-range partition");
            return false;
        };
        let mut slot = slot.lock();

        if is_write {
            if slot.master.as_ref().is_some_and(|m| Arc::ptr_eq(m, node)) {
                return false;
            }
            slot.master = Some(Arc::clone(node));
            return true;
        }

        if slot.replicas.iter().any(|r| Arc::ptr_eq(r, node)) {
            return false;
        }
        if slot.replicas.len() >= self.replica_capacity {
            slot.replicas.pop_front();
        }
        slot.replicas.push_back(Arc::clone(node));
        true
    }

    /// Node that should serve `partition_id`.
    ///
    /// Writes and master-only reads get the master. Other reads rotate over the
    /// replica set and fall back to the master when no replica is known.
    pub fn get(&self, partition_id: u32, is_write: bool, policy: ReadPolicy) -> Option<Arc<Node>> {
        let mut slot = self.slots.get(partition_id as usize)?.lock();
        if is_write || policy == ReadPolicy::MasterOnly || slot.replicas.is_empty() {
            return slot.master.clone();
        }
        let index = slot.next_read % slot.replicas.len();
        slot.next_read = slot.next_read.wrapping_add(1);
        slot.replicas.get(index).cloned()
    }

    pub fn master(&self, partition_id: u32) -> Option<Arc<Node>> {
        self.slots.get(partition_id as usize)?.lock().master.clone()
    }

    pub fn replicas(&self, partition_id: u32) -> Vec<Arc<Node>> {
        self.slots
            .get(partition_id as usize)
            .map(|slot| slot.lock().replicas.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every reference this table holds to `node`. Returns slots touched.
    pub fn remove_node(&self, node: &Arc<Node>) -> usize {
        let mut touched = 0;
        for slot in self.slots.iter() {
            let mut slot = slot.lock();
            if !slot.holds(node) {
                continue;
            }
            if slot.master.as_ref().is_some_and(|m| Arc::ptr_eq(m, node)) {
                slot.master = None;
            }
            slot.replicas.retain(|r| !Arc::ptr_eq(r, node));
            touched += 1;
        }
        touched
    }

    /// Whether any slot still references `node`.
    pub fn references(&self, node: &Arc<Node>) -> bool {
        self.slots.iter().any(|slot| slot.lock().holds(node))
    }
}

/// The per-cluster set of partition tables, created lazily per namespace.
pub struct PartitionTables {
    tables: RwLock<HashMap<String, Arc<PartitionTable>>>,
    n_partitions: AtomicU32,
    replica_capacity: usize,
}

impl PartitionTables {
    pub fn new(replica_capacity: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            n_partitions: AtomicU32::new(0),
            replica_capacity,
        }
    }

    /// Partition count learned from the cluster, if any.
    pub fn n_partitions(&self) -> Option<u32> {
        match self.n_partitions.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Stores the partition count. Only the first non-zero value sticks.
    pub fn set_n_partitions(&self, n: u32) -> bool {
        n != 0
            && self
                .n_partitions
                .compare_exchange(0, n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn table(&self, namespace: &str) -> Option<Arc<PartitionTable>> {
        self.tables.read().get(namespace).cloned()
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Routes `node` for `namespace`/`partition_id`, creating the table on first use.
    ///
    /// Does nothing until the partition count is known.
    pub fn set(&self, node: &Arc<Node>, namespace: &str, partition_id: u32, is_write: bool) -> bool {
        let Some(n_partitions) = self.n_partitions() else {
            return false;
        };
        let table = match self.table(namespace) {
            Some(table) => table,
            None => {
                let mut tables = self.tables.write();
                let table = tables.entry(namespace.to_string()).or_insert_with(|| {
                    debug!(namespace, n_partitions, "creating partition table");
                    Arc::new(PartitionTable::new(
                        namespace,
                        n_partitions,
                        self.replica_capacity,
                    ))
                });
                Arc::clone(table)
            }
        };
        table.set(node, partition_id, is_write)
    }

    pub fn get(
        &self,
        namespace: &str,
        partition_id: u32,
        is_write: bool,
        policy: ReadPolicy,
    ) -> Option<Arc<Node>> {
        self.table(namespace)?.get(partition_id, is_write, policy)
    }

    pub fn remove_node(&self, node: &Arc<Node>) -> usize {
        let tables: Vec<_> = self.tables.read().values().cloned().collect();
        tables.iter().map(|table| table.remove_node(node)).sum()
    }

    pub fn references(&self, node: &Arc<Node>) -> bool {
        self.tables.read().values().any(|table| table.references(node))
    }

    /// Drops every table and with them every node reference they hold.
    pub fn clear(&self) {
        self.tables.write().clear();
    }
}
