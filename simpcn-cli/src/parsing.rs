use anyhow::{anyhow, Context};
use clap::Parser;
use log::LevelFilter;
use simpcn_lib::clock::{Clock, SimulationClock};
use simpcn_lib::latency::{FixedLatency, LatencyModel, SampledLatency};
use simpcn_lib::node::NodeRuntime;
use simpcn_lib::routing::Algorithm;
use simpcn_lib::topology::{CapacityGraph, RoutingTable, Topology, TopologyError};
use simpcn_lib::{NodeId, NodeInfo, SimulationCfg, SubnetId, Transaction, WriteResults};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default time waited for every node in the network to come up before routing starts.
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 20;

/// Default time waited after routing for in-flight messages to settle before the final report is printed.
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 30;

/// Default forwarding latency added by every hop.
pub const DEFAULT_HOP_LATENCY_MS: u64 = 10;

/// Default batch size to flush result data to disk
pub const DEFAULT_PRINT_BATCH_SIZE: u32 = 500;

/// Default value for speeding up the clock.
pub const DEFAULT_CLOCK_SPEEDUP: u32 = 1;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// JSON file describing the local node: {"nid", "ip", "port", "cap", "subnet_ids"}
    pub node_config: PathBuf,
    /// JSON array of the local node's neighbors, where "cap" is the balance of the channel towards each one
    pub neighbor_config: PathBuf,
    /// Edge list of the global network, one 0-indexed "src,dst,capacity" line per directed channel
    pub graph: PathBuf,
    /// Transactions to route, one 1-indexed "src,dst,volume" line each
    pub transactions: PathBuf,
    /// Precomputed routing table, one "dst,n1,n2,...,dst" line per path
    pub paths: PathBuf,
    /// Routing strategy: 1 Flash, 2 Shortest Path, 3 Waterfilling, 4 Spider, 5 LND, 6 SegFlow
    #[clap(long, short, value_parser = clap::value_parser!(u8).range(1..=6))]
    pub algorithm: u8,
    /// ID of the local node, checked against the node config when provided
    #[clap(long, short)]
    pub node_id: Option<NodeId>,
    /// Directory containing a subgraph{sid}.txt edge list for each of the local node's subnets
    #[clap(long, default_value = ".")]
    pub subnet_dir: PathBuf,
    /// Time to wait for the rest of the network to start before routing
    #[clap(long, default_value_t = DEFAULT_STARTUP_DELAY_SECS)]
    pub startup_delay_secs: u64,
    /// Time to wait for in-flight messages to settle before reporting
    #[clap(long, default_value_t = DEFAULT_SETTLE_DELAY_SECS)]
    pub settle_delay_secs: u64,
    /// Forwarding latency added by every hop, or the mean latency when sampling from a poisson distribution
    #[clap(long, default_value_t = DEFAULT_HOP_LATENCY_MS)]
    pub hop_latency_ms: u64,
    /// Sample hop latency from a poisson distribution instead of using a fixed value
    #[clap(long, default_value_t = false)]
    pub poisson_latency: bool,
    /// Speedup multiplier for the clock, which scales every wait and forwarding delay [1-1000]
    #[clap(long, short, default_value_t = DEFAULT_CLOCK_SPEEDUP, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..=1000))]
    pub clock_speedup: u32,
    /// Fail a transaction if any reply takes longer than this, otherwise wait until shutdown
    #[clap(long)]
    pub reply_timeout_secs: Option<u64>,
    /// Seed for random path choice and latency sampling
    #[clap(long, short)]
    pub fix_seed: Option<u64>,
    /// Directory to write per-transaction results to, none are written if not set
    #[clap(long, short)]
    pub results_dir: Option<PathBuf>,
    /// Number of transaction results to batch together before printing to csv file [min: 1]
    #[clap(long, short, default_value_t = DEFAULT_PRINT_BATCH_SIZE, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..u32::MAX as u64))]
    pub print_batch_size: u32,
    /// Level of verbosity of the messages displayed by the node.
    /// Possible values: [off, error, warn, info, debug, trace]
    #[clap(long, short, verbatim_doc_comment, default_value = "info")]
    pub log_level: LevelFilter,
}

impl TryFrom<&Cli> for SimulationCfg {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let mut cfg = SimulationCfg::new(Algorithm::try_from(cli.algorithm)?);
        cfg.reply_timeout = cli.reply_timeout_secs.map(Duration::from_secs);
        cfg.seed = cli.fix_seed;
        cfg.write_results = cli.results_dir.as_ref().map(|dir| WriteResults {
            results_dir: dir.clone(),
            batch_size: cli.print_batch_size,
        });

        Ok(cfg)
    }
}

/// Everything a node reads from disk before it starts.
pub struct NodeInputs {
    pub info: NodeInfo,
    pub neighbors: Vec<NodeInfo>,
    pub topology: Topology,
    pub transactions: Vec<Transaction>,
    pub routing_table: RoutingTable,
}

/// Loads and cross-checks every input file named on the command line.
pub fn load_inputs(cli: &Cli) -> anyhow::Result<NodeInputs> {
    let info = read_node_info(&cli.node_config)?;
    if let Some(id) = cli.node_id {
        if id != info.id {
            anyhow::bail!(
                "node id {id} does not match {} in {}",
                info.id,
                cli.node_config.display()
            );
        }
    }
    log::info!("Node ID: {}.", info.id);

    let global = load_graph(&cli.graph)?;
    log::info!("Graph loaded with {} edges.", global.edge_count());

    let transactions = load_transactions(&cli.transactions)?;
    log::info!("Loaded {} transaction(s).", transactions.len());

    let routing_table = load_routing_table(&cli.paths)?;
    log::info!(
        "Routing table loaded with paths to {} destination(s).",
        routing_table.destination_count()
    );

    let neighbors = read_neighbors(&cli.neighbor_config)?;
    let subnets = load_subnets(&cli.subnet_dir, &info.subnet_ids)?;
    let topology = Topology::new(global, subnets);
    log::info!(
        "Subnet(s) loaded: {:?}.",
        topology.subnet_ids().collect::<Vec<_>>()
    );

    Ok(NodeInputs {
        info,
        neighbors,
        topology,
        transactions,
        routing_table,
    })
}

/// Creates the clock, latency model and shutdown trigger that every task of the node shares.
pub fn create_runtime(cli: &Cli) -> anyhow::Result<NodeRuntime> {
    let clock = SimulationClock::new(cli.clock_speedup)?;
    if clock.speedup() > 1 {
        log::info!("Running with clock speedup x{}.", clock.speedup());
    }
    let clock: Arc<dyn Clock> = Arc::new(clock);
    let latency: Arc<dyn LatencyModel> = if cli.poisson_latency {
        Arc::new(SampledLatency::new_poisson(
            cli.hop_latency_ms as f32,
            cli.fix_seed,
        )?)
    } else {
        Arc::new(FixedLatency::new(Duration::from_millis(cli.hop_latency_ms)))
    };
    log::info!("Forwarding with {}.", latency.name());

    let (shutdown_trigger, shutdown_listener) = triggered::trigger();
    Ok(NodeRuntime {
        clock,
        latency,
        shutdown_trigger,
        shutdown_listener,
    })
}

pub fn read_node_info(path: &Path) -> anyhow::Result<NodeInfo> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("could not read node config {}", path.display()))?;

    serde_json::from_str(&contents).map_err(|e| {
        anyhow!(
            "Could not deserialize node config {} (line {}, col {}, err: {}).",
            path.display(),
            e.line(),
            e.column(),
            e
        )
    })
}

pub fn read_neighbors(path: &Path) -> anyhow::Result<Vec<NodeInfo>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("could not read neighbor config {}", path.display()))?;

    serde_json::from_str(&contents).map_err(|e| {
        anyhow!(
            "Could not deserialize neighbor config {} (line {}, col {}, err: {}).",
            path.display(),
            e.line(),
            e.column(),
            e
        )
    })
}

/// Reads an edge list into a graph where every edge is unprobed. Node IDs are shifted by one, because edge lists are
/// 0-indexed while the rest of the inputs are not. Listed capacities are ignored: the local node only learns them
/// by probing.
pub fn load_graph(path: &Path) -> anyhow::Result<CapacityGraph> {
    let mut edges = Vec::new();

    for_each_record(path, |fields| {
        let [src, dst, capacity] = fields else {
            anyhow::bail!("expected src,dst,capacity but got {} field(s)", fields.len());
        };

        let src: NodeId = parse_field(src, "src")?;
        let dst: NodeId = parse_field(dst, "dst")?;
        parse_field::<f64>(capacity, "capacity")?;
        if src == dst {
            return Err(TopologyError::SelfLoop(src + 1).into());
        }

        edges.push((src + 1, dst + 1));
        Ok(())
    })?;

    Ok(edges.into_iter().collect())
}

/// Loads the edge list of each subnet from `subgraph{sid}.txt` in the directory provided.
pub fn load_subnets(
    dir: &Path,
    subnet_ids: &[SubnetId],
) -> anyhow::Result<BTreeMap<SubnetId, CapacityGraph>> {
    let mut subnets = BTreeMap::new();

    for sid in subnet_ids {
        let graph = load_graph(&dir.join(format!("subgraph{sid}.txt")))?;
        if graph.is_empty() {
            log::warn!("Subnet {sid} has no edges.");
        }
        subnets.insert(*sid, graph);
    }

    Ok(subnets)
}

pub fn load_transactions(path: &Path) -> anyhow::Result<Vec<Transaction>> {
    let mut transactions = Vec::new();

    for_each_record(path, |fields| {
        let [source, destination, volume] = fields else {
            anyhow::bail!("expected src,dst,volume but got {} field(s)", fields.len());
        };

        let volume: f64 = parse_field(volume, "volume")?;
        if !volume.is_finite() || volume < 0.0 {
            anyhow::bail!("volume must be a non-negative number, got {volume}");
        }

        transactions.push(Transaction {
            source: parse_field(source, "src")?,
            destination: parse_field(destination, "dst")?,
            volume,
        });
        Ok(())
    })?;

    Ok(transactions)
}

/// Reads routing table lines of the form `dst,n1,n2,...` where the path that follows the destination must end at it.
pub fn load_routing_table(path: &Path) -> anyhow::Result<RoutingTable> {
    let mut table = RoutingTable::new();

    for_each_record(path, |fields| {
        let Some((destination, hops)) = fields.split_first() else {
            anyhow::bail!("empty path");
        };

        let destination: NodeId = parse_field(destination, "dst")?;
        let nodes = hops
            .iter()
            .map(|n| parse_field(n, "node"))
            .collect::<anyhow::Result<Vec<NodeId>>>()?;

        if nodes.last() != Some(&destination) {
            anyhow::bail!("path {nodes:?} does not end at destination {destination}");
        }

        table.insert(nodes)?;
        Ok(())
    })?;

    Ok(table)
}

/// Calls `parse` with the comma separated fields of every non-empty line in the file, prefixing any error with the
/// file and line that it occurred on.
fn for_each_record<F>(path: &Path, mut parse: F) -> anyhow::Result<()>
where
    F: FnMut(&[&str]) -> anyhow::Result<()>,
{
    let contents =
        fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))?;

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        parse(&fields).with_context(|| format!("{}:{}: bad record", path.display(), index + 1))?;
    }

    Ok(())
}

fn parse_field<T>(field: &str, name: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    field
        .parse()
        .with_context(|| format!("invalid {name} '{field}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use simpcn_lib::topology::EdgeCapacity;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn file_with(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn error_chain(e: anyhow::Error) -> String {
        format!("{e:#}")
    }

    #[test]
    fn test_load_graph_shifts_ids() {
        let file = file_with("0,1,50\n1,0,50\n\n1,2,20.5\n");
        let graph = load_graph(file.path()).unwrap();

        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.get(1, 2), Some(EdgeCapacity::Unprobed));
        assert_eq!(graph.get(2, 3), Some(EdgeCapacity::Unprobed));
        assert_eq!(graph.get(0, 1), None);
    }

    #[test]
    fn test_load_graph_reports_line() {
        let file = file_with("0,1,50\n1,2\n");
        let err = error_chain(load_graph(file.path()).unwrap_err());
        assert!(err.contains(":2: bad record"), "{err}");
        assert!(err.contains("expected src,dst,capacity"), "{err}");

        let file = file_with("0,x,50\n");
        let err = error_chain(load_graph(file.path()).unwrap_err());
        assert!(err.contains(":1: bad record"), "{err}");
        assert!(err.contains("invalid dst 'x'"), "{err}");

        let file = file_with("3,3,50\n");
        let err = error_chain(load_graph(file.path()).unwrap_err());
        assert!(err.contains("SelfLoop"), "{err}");
    }

    #[test]
    fn test_load_subnets() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("subgraph1.txt"), "0,1,10\n1,0,10\n").unwrap();
        fs::write(dir.path().join("subgraph4.txt"), "2,3,10\n").unwrap();

        let subnets = load_subnets(dir.path(), &[1, 4]).unwrap();
        assert_eq!(subnets.keys().copied().collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(subnets[&1].edge_count(), 2);
        assert!(subnets[&4].contains_node(4));

        assert!(load_subnets(dir.path(), &[2]).is_err());
        assert!(load_subnets(dir.path(), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_load_transactions() {
        let file = file_with("1,5,10.5\n1,3,2000\n");
        let transactions = load_transactions(file.path()).unwrap();

        assert_eq!(
            transactions,
            vec![
                Transaction {
                    source: 1,
                    destination: 5,
                    volume: 10.5,
                },
                Transaction {
                    source: 1,
                    destination: 3,
                    volume: 2000.0,
                },
            ]
        );

        let file = file_with("1,5,10\n1,5,-3\n");
        let err = error_chain(load_transactions(file.path()).unwrap_err());
        assert!(err.contains(":2: bad record"), "{err}");
    }

    #[test]
    fn test_load_routing_table() {
        let file = file_with("5,1,5\n5,1,2,5\n7,1,3,7\n");
        let table = load_routing_table(file.path()).unwrap();

        assert_eq!(table.destination_count(), 2);
        assert_eq!(table.paths_to(5), &[vec![1, 5], vec![1, 2, 5]]);
        assert_eq!(table.paths_to(7), &[vec![1, 3, 7]]);

        let file = file_with("5,1,2\n");
        let err = error_chain(load_routing_table(file.path()).unwrap_err());
        assert!(err.contains("does not end at destination 5"), "{err}");

        let file = file_with("5,5\n");
        assert!(load_routing_table(file.path()).is_err());
    }

    #[test]
    fn test_read_configs() {
        let node = file_with(r#"{"nid": 1, "ip": "127.0.0.1", "port": 9001, "subnet_ids": [2]}"#);
        let info = read_node_info(node.path()).unwrap();
        assert_eq!(info.id, 1);
        assert_eq!(info.capacity, 0.0);
        assert_eq!(info.subnet_ids, vec![2]);

        let neighbors = file_with(
            r#"[{"nid": 2, "ip": "127.0.0.1", "port": 9002, "cap": 100.5},
                {"nid": 3, "ip": "127.0.0.1", "port": 9003, "cap": 20}]"#,
        );
        let neighbors = read_neighbors(neighbors.path()).unwrap();
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].capacity, 100.5);
        assert_eq!(neighbors[1].id, 3);

        let bad = file_with(r#"{"nid": 1, "ip": "127.0.0.1"}"#);
        let err = error_chain(read_node_info(bad.path()).unwrap_err());
        assert!(err.contains("Could not deserialize node config"), "{err}");
    }

    #[test]
    fn test_cli_into_cfg() {
        let cli = Cli::parse_from([
            "simpcn",
            "1.json",
            "n1.json",
            "graph.txt",
            "tr1.txt",
            "pa1.txt",
            "--algorithm",
            "6",
            "--reply-timeout-secs",
            "5",
            "--results-dir",
            "results",
        ]);

        let cfg = SimulationCfg::try_from(&cli).unwrap();
        assert_eq!(cfg.algorithm, Algorithm::SegFlow);
        assert_eq!(cfg.reply_timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            cfg.write_results.map(|w| (w.results_dir, w.batch_size)),
            Some((PathBuf::from("results"), DEFAULT_PRINT_BATCH_SIZE))
        );
        assert_eq!(cli.startup_delay_secs, DEFAULT_STARTUP_DELAY_SECS);

        assert!(Cli::try_parse_from([
            "simpcn", "1.json", "n1.json", "graph.txt", "tr1.txt", "pa1.txt", "-a", "7",
        ])
        .is_err());
    }

    #[test]
    fn test_load_inputs_checks_node_id() {
        let dir = tempdir().unwrap();
        let write = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            fs::write(&path, contents).unwrap();
            path.display().to_string()
        };

        let node = write("1.json", r#"{"nid": 1, "ip": "127.0.0.1", "port": 9001, "subnet_ids": [1]}"#);
        let neighbors = write("n1.json", r#"[{"nid": 2, "ip": "127.0.0.1", "port": 9002, "cap": 10}]"#);
        let graph = write("graph.txt", "0,1,10\n1,0,10\n");
        let transactions = write("tr1.txt", "1,2,5\n");
        let paths = write("pa1.txt", "2,1,2\n");
        write("subgraph1.txt", "0,1,10\n");
        let subnet_dir = dir.path().display().to_string();

        let args = |node_id: &str| {
            Cli::parse_from([
                "simpcn",
                node.as_str(),
                neighbors.as_str(),
                graph.as_str(),
                transactions.as_str(),
                paths.as_str(),
                "-a",
                "5",
                "--node-id",
                node_id,
                "--subnet-dir",
                subnet_dir.as_str(),
            ])
        };

        let inputs = load_inputs(&args("1")).unwrap();
        assert_eq!(inputs.info.id, 1);
        assert_eq!(inputs.neighbors.len(), 1);
        assert_eq!(inputs.transactions.len(), 1);
        assert_eq!(inputs.topology.subnets_containing(2), vec![1]);
        assert_eq!(inputs.routing_table.paths_to(2), &[vec![1, 2]]);

        assert!(load_inputs(&args("2")).is_err());
    }
}
