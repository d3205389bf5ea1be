//! Process-level bookkeeping of clusters, owned by the application.

use parking_lot::Mutex;
use tracing::info;

use crate::cluster::Cluster;

/// Every cluster the application has opened, so they can be shut down together.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: Mutex<Vec<Cluster>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `cluster`. Registering the same cluster twice is a no-op.
    pub fn register(&self, cluster: &Cluster) {
        let mut clusters = self.clusters.lock();
        if !clusters.iter().any(|known| known.same_cluster(cluster)) {
            clusters.push(cluster.clone());
        }
    }

    /// Stops tracking `cluster` without closing it.
    pub fn unregister(&self, cluster: &Cluster) -> bool {
        let mut clusters = self.clusters.lock();
        let before = clusters.len();
        clusters.retain(|known| !known.same_cluster(cluster));
        clusters.len() != before
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        self.clusters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.clusters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.lock().is_empty()
    }

    /// Closes and forgets every registered cluster. Returns how many were closed.
    pub fn shutdown_all(&self) -> usize {
        let clusters = std::mem::take(&mut *self.clusters.lock());
        for cluster in &clusters {
            cluster.close();
        }
        info!(clusters = clusters.len(), "all clusters shut down");
        clusters.len()
    }
}
