mod common;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cluster_driver::{Cluster, EventLoop, Host, TokioLoop, Value, digest};
use futures::future::BoxFuture;

use common::{MockCluster, NAMESPACE, manual_config};

/// Tokio loop whose resolver answers from a fixed table.
struct StaticResolver {
    inner: TokioLoop,
    hosts: HashMap<String, Vec<SocketAddr>>,
}

impl EventLoop for StaticResolver {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.inner.spawn(task);
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.inner.sleep(duration)
    }

    fn resolve(&self, host: &Host) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>> {
        let found = self.hosts.get(&host.name).cloned();
        Box::pin(async move {
            found.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown host"))
        })
    }
}

fn resolving(name: &str, addrs: Vec<SocketAddr>) -> Vec<Arc<dyn EventLoop>> {
    let resolver = StaticResolver {
        inner: TokioLoop::current(),
        hosts: HashMap::from([(name.to_string(), addrs)]),
    };
    vec![Arc::new(resolver)]
}

#[tokio::test]
async fn one_seed_discovers_whole_cluster() -> Result<()> {
    let mock = MockCluster::start(&["A", "B", "C"], 4096).await?;
    let config = manual_config().with_seed(Host::new("db.local", 3000));
    let cluster = Cluster::new(config, resolving("db.local", mock.addrs()))?;

    cluster.tend().await;

    assert_eq!(cluster.node_names(), vec!["A", "B", "C"]);
    assert_eq!(cluster.n_partitions(), Some(4096));
    for key in 0..200i64 {
        let digest = digest("users", &Value::from(key))?;
        assert!(cluster.partition_owner(NAMESPACE, &digest, true).is_some());
        assert!(cluster.partition_owner(NAMESPACE, &digest, false).is_some());
    }

    let table = cluster.partition_table(NAMESPACE).expect("table created");
    for pid in [0u32, 1, 2, 4095] {
        let expected = &mock.nodes[(pid % 3) as usize].name;
        assert_eq!(table.master(pid).unwrap().name(), expected);
    }

    cluster.close();
    mock.stop().await;
    Ok(())
}

#[tokio::test]
async fn services_list_finds_peers_not_in_seeds() -> Result<()> {
    let mock = MockCluster::start(&["A", "B", "C"], 64).await?;
    let seed = mock.node("A").addr;
    let config = manual_config().with_seed(Host::new(seed.ip().to_string(), seed.port()));
    let cluster = Cluster::on_current_runtime(config);

    cluster.tend().await;

    assert_eq!(cluster.node_names(), vec!["A", "B", "C"]);
    let table = cluster.partition_table(NAMESPACE).expect("table created");
    assert!((0..64).all(|pid| table.master(pid).is_some()));

    cluster.close();
    mock.stop().await;
    Ok(())
}

#[tokio::test]
async fn failing_node_is_dunned_then_removed() -> Result<()> {
    let mock = MockCluster::start(&["A", "B", "C"], 64).await?;
    let seed = mock.node("A").addr;
    let config = manual_config().with_seed(Host::new(seed.ip().to_string(), seed.port()));
    let cluster = Cluster::on_current_runtime(config);
    cluster.tend().await;
    assert_eq!(cluster.nodes().len(), 3);

    let b = cluster.node("B").expect("B known");
    mock.node("B").set_fail_info(true);

    cluster.tend().await;
    assert!(b.is_dunned());
    assert!(cluster.node("B").is_some(), "dunned node stays until the next sweep");

    cluster.tend().await;
    assert!(cluster.node("B").is_none());
    let table = cluster.partition_table(NAMESPACE).expect("table");
    assert!(!table.references(&b));
    assert_eq!(Arc::strong_count(&b), 1, "only the test holds the node now");

    cluster.close();
    mock.stop().await;
    Ok(())
}

#[tokio::test]
async fn renamed_node_is_dunned() -> Result<()> {
    let mock = MockCluster::start(&["A", "B"], 16).await?;
    let seed = mock.node("A").addr;
    let config = manual_config().with_seed(Host::new(seed.ip().to_string(), seed.port()));
    let cluster = Cluster::on_current_runtime(config);
    cluster.tend().await;

    let a = cluster.node("A").expect("A known");
    mock.node("A").set_info("node", "A2");
    cluster.tend().await;
    assert!(a.is_dunned());

    cluster.close();
    mock.stop().await;
    Ok(())
}

#[tokio::test]
async fn replicas_refetched_only_when_generation_moves() -> Result<()> {
    let mock = MockCluster::start(&["A"], 8).await?;
    let seed = mock.node("A").addr;
    let config = manual_config().with_seed(Host::new(seed.ip().to_string(), seed.port()));
    let cluster = Cluster::on_current_runtime(config);

    cluster.tend().await;
    let a = cluster.node("A").expect("A known");
    assert_eq!(a.partition_generation(), Some(1));
    let after_first = mock.node("A").info_requests();

    cluster.tend().await;
    assert_eq!(mock.node("A").info_requests(), after_first + 1);

    mock.node("A").set_info("partition-generation", "2");
    cluster.tend().await;
    assert_eq!(mock.node("A").info_requests(), after_first + 3);
    assert_eq!(a.partition_generation(), Some(2));

    cluster.close();
    mock.stop().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_seed_leaves_cluster_empty() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let config = manual_config().with_seed(Host::new("127.0.0.1", addr.port()));
    let cluster = Cluster::on_current_runtime(config);
    let ready = cluster.wait_until_ready(Duration::from_millis(150)).await;

    assert!(matches!(ready, Err(cluster_driver::Error::RoutingUnavailable)));
    assert!(cluster.nodes().is_empty());
    assert_eq!(cluster.n_partitions(), None);
    cluster.close();
    Ok(())
}

#[tokio::test]
async fn wait_until_ready_returns_once_routable() -> Result<()> {
    let mock = MockCluster::start(&["A", "B"], 32).await?;
    let seed = mock.node("B").addr;
    let config = manual_config().with_seed(Host::new(seed.ip().to_string(), seed.port()));
    let cluster = Cluster::on_current_runtime(config);

    cluster.wait_until_ready(Duration::from_secs(2)).await?;
    assert_eq!(cluster.node_names(), vec!["A", "B"]);

    cluster.close();
    mock.stop().await;
    Ok(())
}
