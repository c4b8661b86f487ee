//! Runs an in-process Shoal cluster and reports shard leaders.
//!
//! ```bash
//! shoal-cluster --nodes 3 --shards 8 --duration-secs 5
//! shoal-cluster --nodes 5 --shards 2 --isolate-leader --data-dir /tmp/shoal
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use shoal_runtime::{ListenerEvent, LocalCluster, TimingConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// In-process Shoal cluster.
#[derive(Parser, Debug)]
#[command(name = "shoal-cluster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes.
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of shards hosted by every node.
    #[arg(long, default_value = "4")]
    shards: u64,

    /// How long to run before reporting.
    #[arg(long, default_value = "3")]
    duration_secs: u64,

    /// Entries proposed to each shard once it has a leader.
    #[arg(long, default_value = "10")]
    proposals: u64,

    /// Isolate the leader of every shard halfway through.
    #[arg(long)]
    isolate_leader: bool,

    /// Directory for durable term/vote files. In memory if unset.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Election timeout lower bound in milliseconds.
    #[arg(long, default_value = "150")]
    election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value = "50")]
    heartbeat_ms: u64,
}

impl Args {
    fn timing(&self) -> TimingConfig {
        TimingConfig {
            election_timeout_min: Duration::from_millis(self.election_timeout_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_ms * 2),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            ..TimingConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so the report on stdout stays readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!(
        nodes = args.nodes,
        shards = args.shards,
        duration_secs = args.duration_secs,
        "Starting cluster"
    );

    let (cluster, mut events) =
        LocalCluster::start(args.nodes, args.shards, args.timing(), args.data_dir.as_deref()).await?;
    let half = Duration::from_secs(args.duration_secs) / 2;
    let election_wait = half.max(Duration::from_secs(1));

    for &shard in cluster.shards() {
        if cluster.wait_for_leader(shard, election_wait).await.is_none() {
            warn!(shard = %shard, "No leader elected");
            continue;
        }
        for n in 0..args.proposals {
            if let Err(err) = cluster
                .propose(shard, Bytes::from(format!("{shard}/{n}")))
                .await
            {
                warn!(shard = %shard, error = %err, "Proposal failed");
            }
        }
    }

    tokio::time::sleep(half).await;

    if args.isolate_leader {
        for &shard in cluster.shards() {
            if let Some(leader) = cluster.leader(shard).await {
                cluster.network().isolate(leader).await;
            }
        }
        tokio::time::sleep(half).await;
    }

    let mut applied = 0_u64;
    let mut elections = 0_u64;
    while let Ok(event) = events.try_recv() {
        match event {
            ListenerEvent::Applied { .. } => applied += 1,
            ListenerEvent::BecameLeader { .. } => elections += 1,
            _ => {}
        }
    }

    for &shard in cluster.shards() {
        match cluster.leader(shard).await {
            Some(leader) => {
                let term = cluster
                    .statuses(shard)
                    .await
                    .into_iter()
                    .find(|(node, _)| *node == leader)
                    .map(|(_, status)| status.current_term);
                match term {
                    Some(term) => println!("{shard}: leader {leader} in {term}"),
                    None => println!("{shard}: leader {leader}"),
                }
            }
            None => println!("{shard}: no leader"),
        }
    }
    println!("elections won: {elections}, entries applied: {applied}");

    cluster.shutdown().await?;
    Ok(())
}
