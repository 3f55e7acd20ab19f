use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::snapshot::RuntimeSnapshot;

struct ClusterEntry {
    snapshot: Arc<RuntimeSnapshot>,
    revision: u64,
    notify: watch::Sender<u64>,
}

/// Latest per-cluster snapshot, shared between the single-writer refresher
/// and the many reader streams.
///
/// Readers get an `Arc` out under a brief read lock and never block each
/// other. Change notification rides a `watch` channel per cluster, which
/// collapses any backlog to "latest": a slow stream wakes at most once no
/// matter how many refreshes it slept through.
///
/// Identity of content is the snapshot's content-hash `version`; ordering of
/// installs is the cache-assigned monotonic `revision`. Installing a snapshot
/// whose version equals the current one is a no-op and wakes nobody.
pub struct SnapshotCache {
    clusters: RwLock<HashMap<String, ClusterEntry>>,
    next_revision: AtomicU64,
}

/// A stream's registration of interest in one cluster. Dropping it
/// unsubscribes; dropping it twice is trivially idempotent.
pub struct Subscription {
    cluster: String,
    receiver: watch::Receiver<u64>,
}

impl Subscription {
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Waits until a snapshot newer than the last seen one is installed.
    /// Never resolves once the cache is gone.
    pub async fn changed(&mut self) {
        if self.receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            next_revision: AtomicU64::new(1),
        }
    }

    fn bump_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs `snapshot` for `cluster` and wakes that cluster's
    /// subscribers iff the content changed.
    pub fn set_snapshot(&self, cluster: &str, snapshot: RuntimeSnapshot) {
        let mut clusters = self.clusters.write();
        match clusters.get_mut(cluster) {
            Some(entry) => {
                if entry.snapshot.version == snapshot.version {
                    return;
                }
                let revision = self.bump_revision();
                entry.snapshot = Arc::new(snapshot);
                entry.revision = revision;
                let _ = entry.notify.send(revision);
            }
            None => {
                let revision = self.bump_revision();
                let (notify, _) = watch::channel(revision);
                clusters.insert(
                    cluster.to_string(),
                    ClusterEntry {
                        snapshot: Arc::new(snapshot),
                        revision,
                        notify,
                    },
                );
            }
        }
    }

    /// Registers interest in `cluster`, installing the empty snapshot for
    /// previously unknown clusters so subscribers always have something to
    /// read.
    pub fn subscribe(&self, cluster: &str) -> Subscription {
        let mut clusters = self.clusters.write();
        let entry = clusters.entry(cluster.to_string()).or_insert_with(|| {
            let revision = self.bump_revision();
            let (notify, _) = watch::channel(revision);
            ClusterEntry {
                snapshot: Arc::new(RuntimeSnapshot::empty()),
                revision,
                notify,
            }
        });
        Subscription {
            cluster: cluster.to_string(),
            receiver: entry.notify.subscribe(),
        }
    }

    /// Non-blocking read of the latest snapshot and its install revision.
    pub fn get(&self, cluster: &str) -> Option<(Arc<RuntimeSnapshot>, u64)> {
        let clusters = self.clusters.read();
        clusters
            .get(cluster)
            .map(|entry| (Arc::clone(&entry.snapshot), entry.revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn snapshot(pairs: &[(&str, &str)]) -> RuntimeSnapshot {
        RuntimeSnapshot::from_entries(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[tokio::test]
    async fn subscribers_wake_on_content_change() {
        let cache = SnapshotCache::new();
        let mut sub = cache.subscribe("storefront");

        cache.set_snapshot("storefront", snapshot(&[("k", "1")]));
        tokio::time::timeout(Duration::from_secs(1), sub.changed())
            .await
            .expect("subscriber should wake");

        let (snap, _) = cache.get("storefront").unwrap();
        assert_eq!(snap.entries["k"], "1");
    }

    #[tokio::test]
    async fn same_version_install_wakes_nobody() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("storefront", snapshot(&[("k", "1")]));
        let (_, first_revision) = cache.get("storefront").unwrap();

        let mut sub = cache.subscribe("storefront");
        cache.set_snapshot("storefront", snapshot(&[("k", "1")]));

        assert!(
            tokio::time::timeout(Duration::from_millis(100), sub.changed())
                .await
                .is_err(),
            "identical content must not notify"
        );
        let (_, revision) = cache.get("storefront").unwrap();
        assert_eq!(revision, first_revision);
    }

    #[tokio::test]
    async fn revisions_increase_across_installs() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("a", snapshot(&[("k", "1")]));
        let (_, r1) = cache.get("a").unwrap();
        cache.set_snapshot("a", snapshot(&[("k", "2")]));
        let (_, r2) = cache.get("a").unwrap();
        cache.set_snapshot("b", snapshot(&[("k", "3")]));
        let (_, r3) = cache.get("b").unwrap();
        assert!(r1 < r2);
        assert!(r2 < r3);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_cluster_installs_empty() {
        let cache = SnapshotCache::new();
        assert!(cache.get("storefront").is_none());

        let sub = cache.subscribe("storefront");
        assert_eq!(sub.cluster(), "storefront");

        let (snap, _) = cache.get("storefront").unwrap();
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let cache = SnapshotCache::new();
        let sub_a = cache.subscribe("storefront");
        let sub_b = cache.subscribe("storefront");
        drop(sub_a);
        drop(sub_b);

        // Installs after all subscribers left must not error or panic.
        cache.set_snapshot("storefront", snapshot(&[("k", "1")]));
        let mut sub_c = cache.subscribe("storefront");
        cache.set_snapshot("storefront", snapshot(&[("k", "2")]));
        tokio::time::timeout(Duration::from_secs(1), sub_c.changed())
            .await
            .expect("fresh subscriber still wakes");
    }
}
