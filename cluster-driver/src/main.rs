use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use cluster_driver::{
    Cluster, ClusterConfig,
    cli::{Cli, Command, InfoArgs, TendArgs},
    info as info_protocol,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Info(args) => run_info(args).await?,
        Command::Tend(args) => run_tend(args).await?,
    }

    Ok(())
}

async fn run_info(args: InfoArgs) -> Result<()> {
    let addr = tokio::net::lookup_host((args.host.name.as_str(), args.host.port))
        .await
        .with_context(|| format!("failed to resolve {}", args.host))?
        .next()
        .ok_or_else(|| anyhow!("{} resolved to no addresses", args.host))?;

    let response = info_protocol::request(addr, &args.names.join("\n"), args.timeout())
        .await
        .with_context(|| format!("info request to {addr} failed"))?;
    for (name, value) in response.iter() {
        println!("{name}\t{value}");
    }
    Ok(())
}

#[derive(Serialize)]
struct Topology {
    n_partitions: Option<u32>,
    nodes: Vec<NodeSummary>,
    namespaces: Vec<NamespaceSummary>,
}

#[derive(Serialize)]
struct NodeSummary {
    name: String,
    addrs: Vec<String>,
    partition_generation: Option<u64>,
    dun_score: u32,
    dunned: bool,
    masters: usize,
}

#[derive(Serialize)]
struct NamespaceSummary {
    name: String,
    partitions: u32,
    unowned: u32,
}

async fn run_tend(args: TendArgs) -> Result<()> {
    let mut config = ClusterConfig::new()
        .with_info_timeout(args.info_timeout())
        .with_node_tend_interval(Duration::ZERO)
        .with_replicas_min_interval(Duration::ZERO)
        .with_tend_interval(Duration::from_secs(3600));
    config.seeds = args.seeds.clone();

    let cluster = Cluster::on_current_runtime(config);
    for cycle in 1..=args.cycles.max(1) {
        cluster.tend().await;
        info!(cycle, nodes = cluster.nodes().len(), "tend cycle finished");
    }
    if cluster.nodes().is_empty() {
        warn!("no nodes discovered");
    }

    let topology = summarize(&cluster);
    cluster.close();
    println!("{}", serde_json::to_string_pretty(&topology)?);
    Ok(())
}

fn summarize(cluster: &Cluster) -> Topology {
    let tables: Vec<_> = cluster
        .namespaces()
        .into_iter()
        .filter_map(|name| cluster.partition_table(&name))
        .collect();

    let mut nodes: Vec<NodeSummary> = cluster
        .nodes()
        .iter()
        .map(|node| NodeSummary {
            name: node.name().to_string(),
            addrs: node.addrs().iter().map(ToString::to_string).collect(),
            partition_generation: node.partition_generation(),
            dun_score: node.dun_score(),
            dunned: node.is_dunned(),
            masters: tables
                .iter()
                .map(|table| {
                    (0..table.n_partitions())
                        .filter(|&pid| {
                            table
                                .master(pid)
                                .is_some_and(|master| std::sync::Arc::ptr_eq(&master, node))
                        })
                        .count()
                })
                .sum(),
        })
        .collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    let namespaces = tables
        .iter()
        .map(|table| NamespaceSummary {
            name: table.namespace().to_string(),
            partitions: table.n_partitions(),
            unowned: (0..table.n_partitions())
                .filter(|&pid| table.master(pid).is_none())
                .count() as u32,
        })
        .collect();

    Topology {
        n_partitions: cluster.n_partitions(),
        nodes,
        namespaces,
    }
}
