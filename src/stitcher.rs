use geo_types::Point;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::connections::ConnectionPoint;
use crate::error::Error;
use crate::street_graph::StreetGraph;

/// Street-type prefixes ignored when comparing edge labels to anchor
/// street names.
const STREET_TYPE_PREFIXES: [&str; 6] = [
    "cerrada ",
    "calzada ",
    "avenida ",
    "calle ",
    "prolongacion ",
    "prolongación ",
];

#[derive(Debug, Clone)]
pub struct RouteStitcherConfig {
    /// Candidate connection pairs further apart than this are not worth a
    /// path search.
    pub max_pair_distance_m: f64,
    /// Maximum geodesic length of a gap bridge between two otherwise
    /// disconnected confirmed segments.
    pub max_gap_distance_m: f64,
}

impl Default for RouteStitcherConfig {
    fn default() -> Self {
        Self {
            max_pair_distance_m: 10_000.0,
            max_gap_distance_m: 500.0,
        }
    }
}

/// Confidence tier of a reconstructed path piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Anchors and street names both validate the path.
    Confirmed,
    /// Bridge inserted across a detected discontinuity.
    Gap,
    /// No continuity with the previous segment could be established.
    Unconfirmed,
}

/// An ordered node path with its confidence tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSegment {
    pub nodes: Vec<u64>,
    pub confidence: Confidence,
}

/// Travel direction of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "ida")]
    Outbound,
    #[serde(rename = "vuelta")]
    Return,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "ida"),
            Direction::Return => write!(f, "vuelta"),
        }
    }
}

/// One reconstructed branch geometry for one direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteVariant {
    pub branch: u32,
    pub direction: Direction,
    pub segments: Vec<PathSegment>,
}

impl RouteVariant {
    pub fn paths_with(&self, confidence: Confidence) -> Vec<&PathSegment> {
        self.segments
            .iter()
            .filter(|s| s.confidence == confidence)
            .collect()
    }

    pub fn is_all_unconfirmed(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.confidence == Confidence::Unconfirmed)
    }

    /// Flat coordinate geometry for distance queries, in
    /// confirmed / gap / unconfirmed partition order.
    pub fn geometry(&self, graph: &StreetGraph) -> Vec<Point<f64>> {
        let mut points = Vec::new();
        for confidence in [Confidence::Confirmed, Confidence::Gap, Confidence::Unconfirmed] {
            for segment in self.paths_with(confidence) {
                points.extend(graph.path_coordinates(&segment.nodes));
            }
        }
        points
    }
}

/// One leg to stitch: the per-boundary connection lists of a branch in one
/// direction.
#[derive(Debug, Clone)]
pub struct LegInput {
    pub branch: u32,
    pub direction: Direction,
    pub boundaries: Vec<Vec<ConnectionPoint>>,
}

/// Reduction state over the sequence of per-boundary candidate lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    /// The last committed path continues into the next boundary.
    Chaining,
    /// A gap bridge was inserted; the chain continues from its far end.
    Bridging,
    /// Continuity lost; the chain restarts at the next boundary.
    Broken,
}

/// Stitches per-boundary connection sets into continuous route geometry.
pub struct RouteStitcher<'g> {
    graph: &'g StreetGraph,
    config: RouteStitcherConfig,
}

impl<'g> RouteStitcher<'g> {
    pub fn new(graph: &'g StreetGraph, config: RouteStitcherConfig) -> Self {
        Self { graph, config }
    }

    /// Stitch every leg, fanning out across branches. Legs are independent
    /// given the frozen graph, so this is a plain parallel map.
    pub fn stitch_all(&self, legs: Vec<LegInput>) -> Vec<RouteVariant> {
        let pb = ProgressBar::new(legs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} - Stitching legs")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let variants: Vec<RouteVariant> = legs
            .par_iter()
            .map(|leg| {
                let variant = self.stitch_leg(leg);
                pb.inc(1);
                variant
            })
            .collect();

        pb.finish_and_clear();
        variants
    }

    /// Stitch one leg into a route variant.
    ///
    /// Never fails: a leg without any viable boundary produces an
    /// all-unconfirmed (possibly empty) variant.
    pub fn stitch_leg(&self, leg: &LegInput) -> RouteVariant {
        // Validated candidate paths per adjacent boundary pair
        let candidate_lists: Vec<Vec<Vec<u64>>> = leg
            .boundaries
            .windows(2)
            .map(|pair| self.candidate_paths(&pair[0], &pair[1]))
            .collect();

        let segments = self.reduce(&candidate_lists);

        let variant = RouteVariant {
            branch: leg.branch,
            direction: leg.direction,
            segments,
        };

        if variant.is_all_unconfirmed() && !variant.segments.is_empty() {
            warn!(
                "Branch {} {} reconstructed without any confirmed continuity",
                leg.branch, leg.direction
            );
        }

        variant
    }

    /// Shortest paths between the connection nodes of two adjacent
    /// boundaries that survive both validity checks: the path contains
    /// exactly two of the boundaries' anchor nodes, and every internal
    /// edge label is compatible with the street being traversed.
    fn candidate_paths(
        &self,
        from: &[ConnectionPoint],
        to: &[ConnectionPoint],
    ) -> Vec<Vec<u64>> {
        let anchors: HashSet<u64> = from.iter().chain(to.iter()).map(|c| c.node).collect();

        let mut paths = Vec::new();
        for c1 in from {
            for c2 in to {
                let Ok(distance) = self.graph.node_distance_m(c1.node, c2.node) else {
                    continue;
                };
                if distance >= self.config.max_pair_distance_m {
                    continue;
                }

                let route = match self.graph.shortest_path(c1.node, c2.node) {
                    Ok(route) => route,
                    Err(Error::NoPathFound { .. }) => continue,
                    Err(e) => {
                        trace!("Path search {} -> {} failed: {e}", c1.node, c2.node);
                        continue;
                    }
                };

                // The path must pass through exactly the two anchor nodes;
                // revisiting or skipping an anchor disqualifies it.
                let anchor_count = anchors.iter().filter(|n| route.contains(n)).count();
                if anchor_count != 2 {
                    continue;
                }

                // The street traversed between the boundaries is the
                // second street of the originating connection.
                if !self.path_names_compatible(&route, &c1.street_b) {
                    continue;
                }

                paths.push(route);
            }
        }

        paths
    }

    /// Check every internal edge of a path for textual compatibility with
    /// the anchor street name. One incompatible edge disqualifies the
    /// path; unnamed edges are neutral.
    fn path_names_compatible(&self, route: &[u64], anchor_street: &str) -> bool {
        let anchor = strip_type_prefixes(anchor_street);

        for pair in route.windows(2).skip(1) {
            let Some(names) = self.graph.edge_names(pair[0], pair[1]) else {
                continue;
            };
            if names.is_empty() {
                continue;
            }

            let compatible = names.iter().any(|name| {
                let label = strip_type_prefixes(name);
                label.contains(&anchor) || anchor.contains(&label)
            });
            if !compatible {
                return false;
            }
        }

        true
    }

    /// Sequential chain-or-bridge-or-break reduction over the per-boundary
    /// candidate lists.
    fn reduce(&self, candidate_lists: &[Vec<Vec<u64>>]) -> Vec<PathSegment> {
        let mut segments: Vec<PathSegment> = Vec::new();
        let mut last_path: Option<Vec<u64>> = None;
        let mut state = ChainState::Broken;

        for (i, current) in candidate_lists.iter().enumerate() {
            let next = candidate_lists.get(i + 1).filter(|l| !l.is_empty());

            let mut chained: Vec<Vec<u64>> = Vec::new();
            // (geodesic distance, bridge path, feeding path)
            let mut bridges: Vec<(f64, Vec<u64>, Vec<u64>)> = Vec::new();
            let mut leftovers: Vec<Vec<u64>> = Vec::new();

            match next {
                Some(next_paths) => {
                    for r1 in current {
                        let mut continues = false;
                        for r2 in next_paths {
                            if r1.last() == r2.first() {
                                continues = true;
                                continue;
                            }
                            // Bridge candidate between this path's end and
                            // the next path's start
                            let (Some(&end), Some(&start)) = (r1.last(), r2.first()) else {
                                continue;
                            };
                            let Ok(gap_distance) = self.graph.node_distance_m(end, start) else {
                                continue;
                            };
                            if gap_distance >= self.config.max_gap_distance_m {
                                continue;
                            }
                            if let Ok(bridge) = self.graph.shortest_path(end, start) {
                                bridges.push((gap_distance, bridge, r1.clone()));
                            }
                        }
                        if continues {
                            chained.push(r1.clone());
                        }
                    }
                }
                None => {
                    for r1 in current {
                        let continues = last_path
                            .as_ref()
                            .is_some_and(|lp| lp.last() == r1.first());
                        if continues {
                            chained.push(r1.clone());
                        } else {
                            leftovers.push(r1.clone());
                        }
                    }
                }
            }

            if !chained.is_empty() {
                state = ChainState::Chaining;
                last_path = chained.last().cloned();
                segments.extend(chained.into_iter().map(|nodes| PathSegment {
                    nodes,
                    confidence: Confidence::Confirmed,
                }));
            } else if !bridges.is_empty() {
                state = ChainState::Bridging;
                // Smallest geodesic distance wins; ties keep the
                // first-discovered bridge
                let (_, bridge, feeder) = bridges
                    .into_iter()
                    .reduce(|best, candidate| if candidate.0 < best.0 { candidate } else { best })
                    .unwrap();
                segments.push(PathSegment {
                    nodes: feeder,
                    confidence: Confidence::Confirmed,
                });
                last_path = Some(bridge.clone());
                segments.push(PathSegment {
                    nodes: bridge,
                    confidence: Confidence::Gap,
                });
            } else {
                state = ChainState::Broken;
                last_path = None;
                let unconfirmed: Vec<Vec<u64>> = if leftovers.is_empty() {
                    current.clone()
                } else {
                    leftovers
                };
                segments.extend(unconfirmed.into_iter().map(|nodes| PathSegment {
                    nodes,
                    confidence: Confidence::Unconfirmed,
                }));
            }

            trace!("Boundary {i}: state {state:?}");
        }

        debug!(
            "Reduction finished in state {state:?} with {} segment(s)",
            segments.len()
        );
        segments
    }
}

/// Remove street-type prefixes and normalize for label comparison.
fn strip_type_prefixes(name: &str) -> String {
    let mut name = name.to_lowercase();
    for prefix in STREET_TYPE_PREFIXES {
        name = name.replace(prefix, "");
    }
    name.trim().to_string()
}
