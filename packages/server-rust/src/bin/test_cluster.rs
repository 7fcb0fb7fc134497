//! In-process cluster simulation.
//!
//! Starts a state node and several cache nodes over the in-memory bus and
//! remote store, drives random writes and deletes from every node, then
//! waits until the remote store holds the last write issued for every key
//! and every node other than that write's origin holds it locally.
//!
//! The origin is exempt: it never applies its own completion, so an older
//! peer completion landing after its local write leaves its copy stale until
//! the local TTL expires.
//!
//! ```bash
//! test-cluster --nodes 4 --keys 200 --writes 5000 --partitions 8
//! RUST_LOG=debug test-cluster --log-format json --metrics-addr 127.0.0.1:9100
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::Rng;
use tiercache_core::unmarshal_value;
use tiercache_server::bus::MemoryBroker;
use tiercache_server::remote::{MemoryRemoteStore, RemoteStore};
use tiercache_server::telemetry::{init_tracing, LogFormat};
use tiercache_server::{
    init_state_node, shutdown_state_node, CacheError, CacheInstance, CacheOptions,
    StateNodeOptions,
};
use tracing::{info, warn};

/// Simulated tiercache cluster in one process.
#[derive(Debug, Parser)]
#[command(name = "test-cluster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of cache nodes.
    #[arg(long, env = "TIERCACHE_NODES", default_value_t = 3)]
    nodes: usize,

    /// Size of the shared key space.
    #[arg(long, env = "TIERCACHE_KEYS", default_value_t = 100)]
    keys: usize,

    /// Writes issued by each node.
    #[arg(long, env = "TIERCACHE_WRITES", default_value_t = 1_000)]
    writes: usize,

    /// Share of writes that are deletes, from 0.0 to 1.0.
    #[arg(long, default_value_t = 0.1)]
    delete_ratio: f64,

    /// Bus endpoints handed to the broker.
    #[arg(long, env = "TIERCACHE_BROKERS", value_delimiter = ',', default_value = "memory:0")]
    brokers: Vec<String>,

    /// Partitions per topic on the in-memory bus.
    #[arg(long, default_value_t = 4)]
    partitions: usize,

    /// Log output format: compact or json.
    #[arg(long, env = "TIERCACHE_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "TIERCACHE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log per-operation timings.
    #[arg(long)]
    trace: bool,

    /// How long to wait for convergence, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    settle_ms: u64,
}

const LOCAL_TTL: Duration = Duration::from_secs(600);
const RKV_TTL: Duration = Duration::from_secs(3_600);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "serving metrics");
    }

    let broker = Arc::new(MemoryBroker::with_partitions(args.partitions));
    let remote = Arc::new(MemoryRemoteStore::new());

    let reducer = init_state_node(
        StateNodeOptions::new()
            .with_brokers(args.brokers.clone())
            .with_broker(broker.clone())
            .with_remote(remote.clone() as Arc<dyn RemoteStore>),
    )
    .await
    .context("failed to start state node")?;

    let mut nodes = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        let options = CacheOptions::new()
            .with_brokers(args.brokers.clone())
            .with_broker(broker.clone())
            .with_remote(remote.clone() as Arc<dyn RemoteStore>)
            .with_hostname(format!("node-{index}"))
            .with_trace(args.trace)
            // Completions spread over partitions can arrive out of order.
            // Origin copies are still exempt from the convergence check.
            .with_listener_watermarks(true);
        let node = CacheInstance::<String>::new(options)
            .await
            .with_context(|| format!("failed to start node-{index}"))?;
        nodes.push(node);
    }
    info!(nodes = nodes.len(), group = reducer.group(), "cluster started");

    let started = Instant::now();
    let ledger = drive_writes(&nodes, &args)?;
    info!(
        writes = args.writes * nodes.len(),
        elapsed_ms = started.elapsed().as_millis(),
        "writes issued"
    );

    let settle = Duration::from_millis(args.settle_ms);
    let outcome = tokio::select! {
        result = converge(&nodes, remote.as_ref(), &ledger, args.keys, settle) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    for (index, node) in nodes.iter().enumerate() {
        info!(node = index, metrics = ?node.metrics(), "node counters");
        node.close().await;
    }
    info!(
        tracked_keys = reducer.tracked_keys(),
        remote_keys = remote.len(),
        "state node summary"
    );
    shutdown_state_node().await;
    broker.close();

    outcome?;
    info!(elapsed_ms = started.elapsed().as_millis(), "cluster converged");
    Ok(())
}

/// Last write issued for each key and the node that issued it.
///
/// Writes are issued one at a time against a shared clock, so issue order is
/// stamp order and the last entry is the one the reducer keeps.
#[derive(Debug, Default)]
struct Ledger {
    last: HashMap<String, (usize, Option<String>)>,
}

impl Ledger {
    fn record(&mut self, key: &str, node: usize, value: Option<String>) {
        self.last.insert(key.to_string(), (node, value));
    }

    /// Origin node and value of the last write to `key`. `(None, None)` for
    /// keys nobody wrote.
    fn expected(&self, key: &str) -> (Option<usize>, Option<&str>) {
        match self.last.get(key) {
            Some((node, value)) => (Some(*node), value.as_deref()),
            None => (None, None),
        }
    }
}

fn drive_writes(nodes: &[CacheInstance<String>], args: &Args) -> Result<Ledger> {
    if args.keys == 0 {
        bail!("--keys must be at least 1");
    }
    let mut rng = rand::rng();
    let mut ledger = Ledger::default();
    for round in 0..args.writes {
        for (index, node) in nodes.iter().enumerate() {
            let key = format!("k{}", rng.random_range(0..args.keys));
            let (result, value) = if rng.random_bool(args.delete_ratio.clamp(0.0, 1.0)) {
                (node.delete_with_sync(&key), None)
            } else {
                let value = format!("node-{index}-w{round}");
                let result = node.set_with_sync(&key, value.clone(), LOCAL_TTL, RKV_TTL);
                (result, Some(value))
            };
            match result {
                // A rejected local write is still published.
                Ok(()) | Err(CacheError::AdmissionRejected { .. }) => {
                    ledger.record(&key, index, value);
                }
                Err(err) => return Err(err).context("write failed"),
            }
        }
    }
    Ok(ledger)
}

/// Waits until the remote store and every non-origin node hold the last
/// write of every key.
async fn converge(
    nodes: &[CacheInstance<String>],
    remote: &dyn RemoteStore,
    ledger: &Ledger,
    keys: usize,
    settle: Duration,
) -> Result<()> {
    let deadline = Instant::now() + settle;
    loop {
        let mismatches = mismatches(nodes, remote, ledger, keys).await?;
        if mismatches.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            for Mismatch { key, node, found, expected } in mismatches.iter().take(10) {
                warn!(key, ?node, ?found, ?expected, "diverged");
            }
            bail!("{} key/node pairs did not converge", mismatches.len());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A copy that disagrees with the last write. `node` is `None` for the
/// remote store.
#[derive(Debug, PartialEq)]
struct Mismatch {
    key: String,
    node: Option<usize>,
    found: Option<String>,
    expected: Option<String>,
}

async fn mismatches(
    nodes: &[CacheInstance<String>],
    remote: &dyn RemoteStore,
    ledger: &Ledger,
    keys: usize,
) -> Result<Vec<Mismatch>> {
    let Some(first) = nodes.first() else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for k in 0..keys {
        let key = format!("k{k}");
        let (origin, expected) = ledger.expected(&key);
        let stored = remote
            .get(&first.type_tag().prefixed_key(&key))
            .await
            .context("remote read failed")?
            .map(|bytes| unmarshal_value::<String>(&bytes))
            .transpose()?;
        let copies = nodes
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != origin)
            .map(|(index, node)| (Some(index), node.get(&key).ok()));
        for (node, found) in std::iter::once((None, stored)).chain(copies) {
            if found.as_deref() != expected {
                out.push(Mismatch {
                    key: key.clone(),
                    node,
                    found,
                    expected: expected.map(str::to_string),
                });
            }
        }
    }
    Ok(out)
}
