use chrono::{DateTime, NaiveDateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use crate::batch::BatchResults;
use crate::classifier::CandidateGeometry;
use crate::denoise::GpsPoint;
use crate::error::Result;
use crate::stitcher::{Confidence, Direction, RouteVariant};
use crate::street_graph::StreetGraph;

/// Extracted street-name tokens for one branch, as delivered by the table
/// extraction collaborator. Each direction may carry several token runs
/// (one per extracted table block); a leg is their concatenation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchTokens {
    #[serde(rename = "trip_number")]
    pub branch: u32,
    pub ida: Vec<Vec<String>>,
    pub vuelta: Vec<Vec<String>>,
}

impl BranchTokens {
    /// The flat token sequence of one direction's leg.
    pub fn leg_tokens(&self, direction: Direction) -> Vec<String> {
        let runs = match direction {
            Direction::Outbound => &self.ida,
            Direction::Return => &self.vuelta,
        };
        runs.iter().flatten().cloned().collect()
    }
}

pub fn read_branch_tokens(path: &Path) -> Result<Vec<BranchTokens>> {
    let file = File::open(path)?;
    let branches: Vec<BranchTokens> = serde_json::from_reader(BufReader::new(file))?;
    info!("Loaded token lists for {} branch(es) from {:?}", branches.len(), path);
    Ok(branches)
}

/// Read the gazetteer: one lower-cased street name per line.
pub fn read_gazetteer(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let mut names = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let name = line.trim().to_lowercase();
        if !name.is_empty() {
            names.push(name);
        }
    }
    info!("Loaded {} gazetteer entries from {:?}", names.len(), path);
    Ok(names)
}

/// One row of the raw GPS feed.
#[derive(Debug, Deserialize)]
struct GpsFeedRow {
    #[serde(rename = "vehicle_id")]
    vehicle: String,
    #[serde(rename = "route_id")]
    route: String,
    timestamp: String,
    lat: f64,
    lon: f64,
}

/// Read the GPS feed CSV, optionally keeping only one route id.
///
/// Timestamps are accepted as RFC 3339 or as naive `YYYY-MM-DD HH:MM:SS`
/// (interpreted as UTC); rows with unparseable timestamps are dropped with
/// a warning.
pub fn read_gps_feed(path: &Path, route_filter: Option<&str>) -> Result<Vec<GpsPoint>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut points = Vec::new();
    let mut dropped = 0usize;

    for row in reader.deserialize() {
        let row: GpsFeedRow = row?;
        if let Some(route) = route_filter {
            if row.route != route {
                continue;
            }
        }
        match parse_timestamp(&row.timestamp) {
            Some(time) => {
                points.push(GpsPoint::new(row.lat, row.lon, time, &row.vehicle, &row.route))
            }
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        warn!("Dropped {dropped} feed row(s) with unparseable timestamps");
    }
    info!("Loaded {} GPS fixes from {:?}", points.len(), path);
    Ok(points)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Persisted geometry of one branch direction, partitioned by confidence.
/// Coordinates are (lat, lon) pairs per path node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantGeometryRecord {
    pub branch: u32,
    pub direction: Direction,
    pub confirmada: Vec<Vec<(f64, f64)>>,
    pub hueco: Vec<Vec<(f64, f64)>>,
    pub inconfirmada: Vec<Vec<(f64, f64)>>,
}

impl VariantGeometryRecord {
    pub fn from_variant(variant: &RouteVariant, graph: &StreetGraph) -> Self {
        let coords = |confidence: Confidence| -> Vec<Vec<(f64, f64)>> {
            variant
                .paths_with(confidence)
                .into_iter()
                .map(|segment| {
                    graph
                        .path_coordinates(&segment.nodes)
                        .into_iter()
                        .map(|p| (p.y(), p.x()))
                        .collect()
                })
                .collect()
        };

        Self {
            branch: variant.branch,
            direction: variant.direction,
            confirmada: coords(Confidence::Confirmed),
            hueco: coords(Confidence::Gap),
            inconfirmada: coords(Confidence::Unconfirmed),
        }
    }

    /// All coordinates in confidence partition order.
    fn flat_points(&self) -> impl Iterator<Item = [f64; 2]> + '_ {
        self.confirmada
            .iter()
            .chain(self.hueco.iter())
            .chain(self.inconfirmada.iter())
            .flatten()
            .map(|&(lat, lon)| [lon, lat])
    }
}

pub fn write_route_geometries(
    path: &Path,
    variants: &[RouteVariant],
    graph: &StreetGraph,
) -> Result<()> {
    let records: Vec<VariantGeometryRecord> = variants
        .iter()
        .map(|v| VariantGeometryRecord::from_variant(v, graph))
        .collect();
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &records)?;
    info!("Wrote {} route geometry record(s) to {:?}", records.len(), path);
    Ok(())
}

pub fn read_route_geometries(path: &Path) -> Result<Vec<VariantGeometryRecord>> {
    let file = File::open(path)?;
    let records: Vec<VariantGeometryRecord> = serde_json::from_reader(BufReader::new(file))?;
    info!("Loaded {} route geometry record(s) from {:?}", records.len(), path);
    Ok(records)
}

/// Build classifier candidates from persisted geometry records, merging
/// both directions of each branch, branches in ascending order.
pub fn candidates_from_records(records: &[VariantGeometryRecord]) -> Vec<CandidateGeometry> {
    let mut by_branch: BTreeMap<u32, Vec<[f64; 2]>> = BTreeMap::new();
    for record in records {
        by_branch
            .entry(record.branch)
            .or_default()
            .extend(record.flat_points());
    }
    by_branch
        .into_iter()
        .map(|(branch, points)| CandidateGeometry::new(branch, points))
        .collect()
}

/// Write per-(vehicle, date) prediction records as CSV. Skipped units keep
/// their reason in the last column.
pub fn write_predictions(path: &Path, results: &BatchResults) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "vehicle",
        "date",
        "predicted_branch",
        "deviation",
        "mean_deviation",
        "skip_reason",
    ])?;

    let mut rows = 0usize;
    for by_date in results.values() {
        for record in by_date.values() {
            writer.write_record([
                record.vehicle.clone(),
                record.date.to_string(),
                record
                    .predicted_branch
                    .map(|b| b.to_string())
                    .unwrap_or_default(),
                record.deviation.map(|d| d.to_string()).unwrap_or_default(),
                record
                    .mean_deviation
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                record.skip_reason.clone().unwrap_or_default(),
            ])?;
            rows += 1;
        }
    }
    writer.flush()?;
    info!("Wrote {rows} prediction row(s) to {:?}", path);
    Ok(())
}
