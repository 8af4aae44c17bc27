mod batch;
mod classifier;
mod connections;
mod denoise;
mod error;
mod io;
mod name_resolver;
mod stitcher;
mod street_graph;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchConfig, classify_batch};
use crate::classifier::candidates_from_variants;
use crate::connections::{ConnectionFinder, ConnectionFinderConfig};
use crate::denoise::DenoiseConfig;
use crate::io::{
    candidates_from_records, read_branch_tokens, read_gazetteer, read_gps_feed,
    read_route_geometries, write_predictions, write_route_geometries,
};
use crate::name_resolver::{
    NameCandidateSet, NameResolver, NameResolverConfig, RemoteGazetteer, RemoteGazetteerConfig,
};
use crate::stitcher::{Direction, LegInput, RouteStitcher, RouteStitcherConfig, RouteVariant};
use crate::street_graph::StreetGraph;

/// Pipeline configuration: file locations plus the tuning knobs of every
/// stage. Loaded from a JSON file given as the first argument; every field
/// has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PipelineConfig {
    /// OSM PBF extract to build the street graph from.
    network_pbf: Option<PathBuf>,
    /// Alternative JSON network artifact (nodes + edge list).
    network_json: Option<PathBuf>,
    /// Bincode snapshot cache of the loaded graph.
    graph_snapshot: PathBuf,
    /// Extracted street-name tokens per branch.
    branch_tokens: PathBuf,
    /// Optional gazetteer file; defaults to the graph's own street names.
    gazetteer: Option<PathBuf>,
    /// Raw GPS feed CSV.
    gps_feed: PathBuf,
    /// Route id the feed is filtered to.
    route_id: String,
    output_dir: PathBuf,
    /// Re-stitch even when a geometry artifact already exists.
    force_reconstruct: bool,
    /// Consult the remote gazetteer for tokens the local pass leaves
    /// empty.
    use_remote_gazetteer: bool,

    similarity_threshold: f64,
    near_miss_threshold_m: f64,
    max_gap_distance_m: f64,
    rounding_precision: u32,
    time_window_s: i64,
    lookahead: usize,
    worker_threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            network_pbf: Some(PathBuf::from("sample/mexico-city.osm.pbf")),
            network_json: None,
            graph_snapshot: PathBuf::from("sample/street-graph.bin"),
            branch_tokens: PathBuf::from("sample/branch-tokens.json"),
            gazetteer: None,
            gps_feed: PathBuf::from("sample/gps-feed.csv"),
            route_id: "ruta 5".to_string(),
            output_dir: PathBuf::from("output"),
            force_reconstruct: false,
            use_remote_gazetteer: false,
            similarity_threshold: 0.95,
            near_miss_threshold_m: 350.0,
            max_gap_distance_m: 500.0,
            rounding_precision: 4,
            time_window_s: 120,
            lookahead: 3,
            worker_threads: 4,
        }
    }
}

impl PipelineConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {path:?}"))
    }

    fn geometries_path(&self) -> PathBuf {
        self.output_dir.join("route-geometries.json")
    }

    fn predictions_path(&self) -> PathBuf {
        self.output_dir.join("predictions.csv")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(Path::new(&path))?,
        None => PipelineConfig::default(),
    };
    info!("Starting route reconstruction pipeline for {:?}", config.route_id);

    std::fs::create_dir_all(&config.output_dir)?;

    let graph = load_street_graph(&config)?;
    info!(
        "Street graph ready: {} nodes, {} edges",
        graph.node_count(),
        graph.edge_count()
    );

    // Step 1-3: reconstruct route variant geometries, unless a previous
    // run already persisted them
    let geometries_path = config.geometries_path();
    let candidates = if geometries_path.exists() && !config.force_reconstruct {
        info!("Using existing route geometries from {geometries_path:?}");
        let records = read_route_geometries(&geometries_path)?;
        candidates_from_records(&records)
    } else {
        let variants = reconstruct_routes(&config, &graph).await?;
        write_route_geometries(&geometries_path, &variants, &graph)?;
        candidates_from_variants(&variants, &graph)
    };

    if candidates.is_empty() {
        bail!("No route variant geometries available for classification");
    }

    // Step 4: classify every (vehicle, day) trace of the feed
    let feed = read_gps_feed(&config.gps_feed, Some(&config.route_id))?;
    if feed.is_empty() {
        warn!("GPS feed contains no rows for route {:?}", config.route_id);
    }

    let batch_config = BatchConfig {
        worker_threads: config.worker_threads,
        denoise: DenoiseConfig {
            rounding_precision: config.rounding_precision,
            time_window_s: config.time_window_s,
            lookahead: config.lookahead,
        },
    };
    let results = classify_batch(feed, &candidates, &batch_config)?;
    write_predictions(&config.predictions_path(), &results)?;

    info!("Pipeline finished");
    Ok(())
}

/// Load the street graph, preferring the snapshot cache and writing one
/// after a cold load.
fn load_street_graph(config: &PipelineConfig) -> Result<StreetGraph> {
    if config.graph_snapshot.exists() {
        info!("Loading street graph snapshot {:?}", config.graph_snapshot);
        return Ok(StreetGraph::load_snapshot(&config.graph_snapshot)?);
    }

    let graph = if let Some(json) = &config.network_json {
        info!("Loading street network from JSON {:?}", json);
        StreetGraph::from_json(json)?
    } else if let Some(pbf) = &config.network_pbf {
        info!("Loading street network from OSM extract {:?}", pbf);
        StreetGraph::from_osm_pbf(pbf)?
    } else {
        bail!("Config needs either network_pbf or network_json");
    };

    if let Err(e) = graph.save_snapshot(&config.graph_snapshot) {
        warn!("Could not write graph snapshot: {e}");
    }
    Ok(graph)
}

/// Steps 1-3: resolve tokens, find connections, stitch geometry for every
/// branch and direction.
async fn reconstruct_routes(
    config: &PipelineConfig,
    graph: &StreetGraph,
) -> Result<Vec<RouteVariant>> {
    let branches = read_branch_tokens(&config.branch_tokens)?;

    let gazetteer = match &config.gazetteer {
        Some(path) => read_gazetteer(path)?,
        None => graph.street_names(),
    };
    let resolver = NameResolver::new(
        gazetteer,
        NameResolverConfig {
            similarity_threshold: config.similarity_threshold,
            ..NameResolverConfig::default()
        },
    );

    let remote = if config.use_remote_gazetteer {
        Some(RemoteGazetteer::new(RemoteGazetteerConfig::default())?)
    } else {
        None
    };

    let finder = ConnectionFinder::new(
        graph,
        ConnectionFinderConfig {
            near_miss_threshold_m: config.near_miss_threshold_m,
        },
    );

    let mut legs = Vec::new();
    for branch in &branches {
        for direction in [Direction::Outbound, Direction::Return] {
            let tokens = branch.leg_tokens(direction);
            if tokens.is_empty() {
                continue;
            }

            let mut sets = resolver.resolve_leg(&tokens);
            if let Some(remote) = &remote {
                augment_with_remote(&mut sets, &resolver, remote, graph).await;
            }

            let boundaries = finder.connections_for_leg(&sets);
            legs.push(LegInput {
                branch: branch.branch,
                direction,
                boundaries,
            });
        }
    }

    info!("Stitching {} leg(s)", legs.len());
    let stitcher = RouteStitcher::new(
        graph,
        RouteStitcherConfig {
            max_gap_distance_m: config.max_gap_distance_m,
            ..RouteStitcherConfig::default()
        },
    );
    Ok(stitcher.stitch_all(legs))
}

/// Ask the remote gazetteer about tokens the local pass could not resolve.
/// Only names the street graph actually knows are accepted; a failing
/// lookup just leaves the set empty.
async fn augment_with_remote(
    sets: &mut [NameCandidateSet],
    resolver: &NameResolver,
    remote: &RemoteGazetteer,
    graph: &StreetGraph,
) {
    for set in sets.iter_mut() {
        if !set.is_empty() || resolver.is_skip_marker(&set.token) {
            continue;
        }
        let names = remote.resolve_or_empty(&set.token).await;
        let usable: Vec<String> = names
            .into_iter()
            .filter(|name| !graph.edges_with_name(name).is_empty())
            .collect();
        if !usable.is_empty() {
            info!(
                "Remote gazetteer recovered {} candidate(s) for {:?}",
                usable.len(),
                set.token
            );
            set.candidates = usable;
        }
    }
}
