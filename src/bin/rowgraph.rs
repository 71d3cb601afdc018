//! Loads a node and edge list into an in-memory row store and reports how
//! the edges were laid out.
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Args, Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rowgraph::{
    CounterMetrics, EdgeRequest, Graph, GraphConfig, GraphError, MemoryStore, ScalarValue,
    Throttle, TypeCatalog, Uid,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rowgraph",
    version,
    about = "Attach a CSV edge list through the rowgraph edge protocol"
)]
struct Cli {
    #[arg(long, env = "ROWGRAPH_CONFIG", value_name = "FILE", help = "Graph configuration (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Type catalog (TOML)")]
    catalog: PathBuf,

    #[arg(long, value_name = "FILE", help = "CSV with columns id,type and one column per scalar attribute")]
    nodes: PathBuf,

    #[arg(long, value_name = "FILE", help = "CSV with columns child,parent,predicate")]
    edges: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    #[arg(
        long,
        value_name = "ID:PREDICATE",
        help = "Print the children of a node after loading (repeatable)"
    )]
    show: Vec<String>,

    #[arg(long, help = "Hide the progress bar")]
    quiet: bool,

    #[arg(
        long,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for the summary"
    )]
    format: OutputFormat,
}

#[derive(Args, Debug)]
struct Overrides {
    #[arg(long, help = "Override embedded_threshold")]
    embedded_threshold: Option<usize>,

    #[arg(long, help = "Override max_overflow")]
    max_overflow: Option<usize>,

    #[arg(long, help = "Override overflow_batch_limit")]
    batch_limit: Option<usize>,

    #[arg(long, help = "Override attach_ceiling")]
    attach_ceiling: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    nodes: usize,
    edges: usize,
    attached: usize,
    rejected: usize,
    failed: usize,
    overflow_rows: u64,
    batches_reopened: u64,
    cache_hits: u64,
    cache_misses: u64,
    cache_hit_ratio: f64,
    peak_in_flight: usize,
    children: Vec<Listing>,
}

#[derive(Debug, Serialize)]
struct Listing {
    node: String,
    predicate: String,
    children: Vec<String>,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rowgraph=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = apply_overrides(GraphConfig::load(cli.config.as_deref())?, &cli.overrides);
    let catalog = TypeCatalog::load(&cli.catalog)?;

    let metrics = Arc::new(CounterMetrics::default());
    let throttle = Arc::new(Throttle::start(config.throttle_default_ceiling));
    let graph = Arc::new(
        Graph::new(Arc::new(MemoryStore::new()), catalog, config).with_metrics(metrics.clone()),
    );

    let ids = load_nodes(&graph, &cli.nodes)?;
    let requests = load_edges(&ids, &cli.edges)?;
    info!(nodes = ids.len(), edges = requests.len(), "rowgraph.loaded");

    let progress = progress_bar(requests.len() as u64, cli.quiet);
    let scheduler = graph.scheduler(Arc::clone(&throttle))?;
    let tickets = requests
        .into_iter()
        .map(|request| scheduler.submit(request))
        .collect::<Result<Vec<_>, _>>()?;

    let mut summary = Summary {
        nodes: ids.len(),
        edges: tickets.len(),
        ..Summary::default()
    };
    for ticket in tickets {
        let errors = ticket.wait();
        if errors.is_empty() {
            summary.attached += 1;
        } else if errors.iter().all(GraphError::is_gatekeeper_rejection) {
            summary.rejected += 1;
        } else {
            for err in &errors {
                warn!(error = %err, "rowgraph.attach_failed");
            }
            summary.failed += 1;
        }
        progress.inc(1);
    }
    scheduler.wait_idle()?;
    progress.finish_and_clear();

    let stats = scheduler.stats()?;
    let cache = graph.cache_stats();
    summary.peak_in_flight = stats.peak_in_flight;
    summary.overflow_rows = metrics.overflow_rows_created.load(Ordering::Relaxed);
    summary.batches_reopened = metrics.batches_reopened.load(Ordering::Relaxed);
    summary.cache_hits = cache.hits;
    summary.cache_misses = cache.misses;
    summary.cache_hit_ratio = cache.hit_ratio();
    for target in &cli.show {
        summary.children.push(list_children(&graph, &ids, target)?);
    }

    emit(cli.format, &summary)
}

fn apply_overrides(mut config: GraphConfig, overrides: &Overrides) -> GraphConfig {
    if let Some(value) = overrides.embedded_threshold {
        config.embedded_threshold = value;
    }
    if let Some(value) = overrides.max_overflow {
        config.max_overflow = value;
    }
    if let Some(value) = overrides.batch_limit {
        config.overflow_batch_limit = value;
    }
    if let Some(value) = overrides.attach_ceiling {
        config.attach_ceiling = value;
    }
    config.normalize()
}

fn progress_bar(len: u64, quiet: bool) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if quiet {
        bar.set_draw_target(ProgressDrawTarget::hidden());
    } else if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} edges {msg}") {
        bar.set_style(style);
    }
    bar
}

/// Creates every node in the file and maps its external id to the new UID.
fn load_nodes(graph: &Graph, path: &Path) -> Result<HashMap<String, Uid>, Box<dyn Error>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let headers = reader.headers()?.clone();
    let id_col = column(&headers, "id")?;
    let type_col = column(&headers, "type")?;

    let mut ids = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let id = record.get(id_col).unwrap_or_default().to_string();
        let ty = graph.catalog().get(record.get(type_col).unwrap_or_default())?;
        let mut scalars: Vec<(&str, ScalarValue)> = Vec::new();
        for (idx, (header, cell)) in headers.iter().zip(record.iter()).enumerate() {
            if idx == id_col || idx == type_col || cell.is_empty() {
                continue;
            }
            let attr = ty.attribute(header)?;
            scalars.push((header, attr.kind.parse_value(cell)?));
        }
        let uid = graph.create_node(&ty.name, &scalars)?;
        if ids.insert(id.clone(), uid).is_some() {
            return Err(format!("duplicate node id {id}").into());
        }
    }
    Ok(ids)
}

fn load_edges(ids: &HashMap<String, Uid>, path: &Path) -> Result<Vec<EdgeRequest>, Box<dyn Error>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let headers = reader.headers()?.clone();
    let child_col = column(&headers, "child")?;
    let parent_col = column(&headers, "parent")?;
    let predicate_col = column(&headers, "predicate")?;

    let mut requests = Vec::new();
    for record in reader.records() {
        let record = record?;
        let child = lookup(ids, record.get(child_col).unwrap_or_default())?;
        let parent = lookup(ids, record.get(parent_col).unwrap_or_default())?;
        let predicate = record.get(predicate_col).unwrap_or_default();
        requests.push(EdgeRequest::new(child, parent, predicate));
    }
    Ok(requests)
}

fn list_children(graph: &Graph, ids: &HashMap<String, Uid>, target: &str) -> Result<Listing, Box<dyn Error>> {
    let (node, predicate) = target
        .split_once(':')
        .ok_or_else(|| format!("--show expects ID:PREDICATE, got {target}"))?;
    let names: HashMap<Uid, &str> = ids.iter().map(|(name, uid)| (*uid, name.as_str())).collect();
    let view = graph.children(lookup(ids, node)?, predicate)?;
    let children = view
        .children()
        .into_iter()
        .map(|uid| names.get(&uid).map_or_else(|| uid.to_string(), |name| name.to_string()))
        .collect();
    Ok(Listing {
        node: node.to_string(),
        predicate: predicate.to_string(),
        children,
    })
}

fn column(headers: &csv::StringRecord, name: &str) -> Result<usize, Box<dyn Error>> {
    headers
        .iter()
        .position(|header| header == name)
        .ok_or_else(|| format!("missing column {name}").into())
}

fn lookup(ids: &HashMap<String, Uid>, id: &str) -> Result<Uid, Box<dyn Error>> {
    ids.get(id)
        .copied()
        .ok_or_else(|| format!("unknown node id {id}").into())
}

fn emit(format: OutputFormat, summary: &Summary) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Text => {
            println!("nodes:          {}", summary.nodes);
            println!("edges:          {}", summary.edges);
            println!("attached:       {}", summary.attached);
            println!("rejected:       {}", summary.rejected);
            println!("failed:         {}", summary.failed);
            println!("overflow rows:  {}", summary.overflow_rows);
            println!("reopened:       {}", summary.batches_reopened);
            println!(
                "cache:          {} hits / {} misses ({:.1}% hit ratio)",
                summary.cache_hits,
                summary.cache_misses,
                summary.cache_hit_ratio * 100.0
            );
            println!("peak in flight: {}", summary.peak_in_flight);
            for listing in &summary.children {
                println!(
                    "{} {}: {}",
                    listing.node,
                    listing.predicate,
                    listing.children.join(", ")
                );
            }
        }
    }
    Ok(())
}
