use log::{debug, trace};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::name_resolver::NameCandidateSet;
use crate::street_graph::StreetGraph;

#[derive(Debug, Clone)]
pub struct ConnectionFinderConfig {
    /// Maximum geodesic distance for a near-miss connection between two
    /// streets that share no node.
    pub near_miss_threshold_m: f64,
}

impl Default for ConnectionFinderConfig {
    fn default() -> Self {
        Self {
            near_miss_threshold_m: 350.0,
        }
    }
}

/// A node that plausibly joins two consecutive streets of a leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPoint {
    pub node: u64,
    pub street_a: String,
    pub street_b: String,
}

/// Finds the nodes joining consecutive resolved street names.
///
/// Direct intersections (shared nodes) dominate; only when two streets
/// share no node does the geodesic near-miss search run.
pub struct ConnectionFinder<'g> {
    graph: &'g StreetGraph,
    config: ConnectionFinderConfig,
}

impl<'g> ConnectionFinder<'g> {
    pub fn new(graph: &'g StreetGraph, config: ConnectionFinderConfig) -> Self {
        Self { graph, config }
    }

    /// Connection points for each adjacent token pair of a leg.
    ///
    /// Returns one list per boundary (`sets.len() - 1` lists). A node is
    /// emitted at most once per leg, in first-seen order; a boundary with
    /// no viable connection yields an empty list, which the stitcher
    /// surfaces as unconfirmed.
    pub fn connections_for_leg(&self, sets: &[NameCandidateSet]) -> Vec<Vec<ConnectionPoint>> {
        let mut boundaries = Vec::new();
        let mut emitted: HashSet<u64> = HashSet::new();

        for pair in sets.windows(2) {
            let mut connections = Vec::new();

            for name_a in &pair[0].candidates {
                for name_b in &pair[1].candidates {
                    for point in self.connections_between(name_a, name_b) {
                        if emitted.insert(point.node) {
                            connections.push(point);
                        }
                    }
                }
            }

            trace!(
                "Boundary {:?} -> {:?}: {} connection(s)",
                pair[0].token,
                pair[1].token,
                connections.len()
            );
            boundaries.push(connections);
        }

        debug!(
            "Leg of {} tokens produced {} boundaries",
            sets.len(),
            boundaries.len()
        );
        boundaries
    }

    /// All plausible joining nodes for one street-name pair.
    pub fn connections_between(&self, street_a: &str, street_b: &str) -> Vec<ConnectionPoint> {
        // Self-pairing is meaningless
        if street_a == street_b {
            return Vec::new();
        }

        let nodes_a = self.graph.nodes_with_name(street_a);
        let nodes_b = self.graph.nodes_with_name(street_b);

        let direct = self.direct_intersections(street_a, street_b, &nodes_a, &nodes_b);
        if !direct.is_empty() {
            return direct;
        }

        self.near_misses(street_a, street_b, &nodes_a, &nodes_b)
    }

    fn direct_intersections(
        &self,
        street_a: &str,
        street_b: &str,
        nodes_a: &[u64],
        nodes_b: &[u64],
    ) -> Vec<ConnectionPoint> {
        let set_b: HashSet<u64> = nodes_b.iter().copied().collect();
        nodes_a
            .iter()
            .filter(|n| set_b.contains(n))
            .map(|&node| ConnectionPoint {
                node,
                street_a: street_a.to_string(),
                street_b: street_b.to_string(),
            })
            .collect()
    }

    /// Near-miss search: the two globally-smallest distinct node-pair
    /// distances qualify a node when they stay under the threshold.
    fn near_misses(
        &self,
        street_a: &str,
        street_b: &str,
        nodes_a: &[u64],
        nodes_b: &[u64],
    ) -> Vec<ConnectionPoint> {
        let mut distances: Vec<(f64, u64)> = Vec::new();
        for &n1 in nodes_a {
            for &n2 in nodes_b {
                let Ok(d) = self.graph.node_distance_m(n1, n2) else {
                    continue;
                };
                distances.push((d, n1));
                distances.push((d, n2));
            }
        }

        let distinct: BTreeSet<OrderedFloat<f64>> = distances
            .iter()
            .map(|&(d, _)| OrderedFloat(d))
            .collect();
        if distinct.len() < 2 {
            return Vec::new();
        }

        let mut smallest = distinct.into_iter().take(2);
        let first = smallest.next().unwrap();
        let second = smallest.next().unwrap();

        distances
            .into_iter()
            .filter(|&(d, _)| {
                let d = OrderedFloat(d);
                (d == first || d == second) && d.0 <= self.config.near_miss_threshold_m
            })
            .map(|(_, node)| ConnectionPoint {
                node,
                street_a: street_a.to_string(),
                street_b: street_b.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::street_graph::EdgeInfo;
    use geo_types::Coord;
    use std::collections::HashMap;

    fn candidate_set(token: &str, names: &[&str]) -> NameCandidateSet {
        NameCandidateSet {
            token: token.to_string(),
            candidates: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn edge(names: &[&str], length_m: f64) -> EdgeInfo {
        EdgeInfo {
            names: names.iter().map(|s| s.to_string()).collect(),
            length_m,
            oneway: false,
        }
    }

    /// Reforma runs 1-2, Juarez runs 2-3: they intersect at node 2.
    /// Hidalgo runs 4-5, roughly 200 m from Juarez's node 3 but sharing
    /// nothing with it.
    fn fixture() -> StreetGraph {
        let nodes = HashMap::from([
            (1, Coord { x: -99.100, y: 19.400 }),
            (2, Coord { x: -99.090, y: 19.400 }),
            (3, Coord { x: -99.090, y: 19.390 }),
            (4, Coord { x: -99.0918, y: 19.390 }),
            (5, Coord { x: -99.0918, y: 19.380 }),
        ]);
        let edges = vec![
            (1, 2, edge(&["Reforma"], 1000.0)),
            (2, 3, edge(&["Juarez"], 1100.0)),
            (4, 5, edge(&["Hidalgo"], 1100.0)),
        ];
        StreetGraph::from_parts(nodes, edges)
    }

    #[test]
    fn self_pairing_yields_nothing() {
        let graph = fixture();
        let finder = ConnectionFinder::new(&graph, ConnectionFinderConfig::default());
        assert!(finder.connections_between("reforma", "reforma").is_empty());
    }

    #[test]
    fn shared_node_wins_without_distance_search() {
        let graph = fixture();
        let finder = ConnectionFinder::new(&graph, ConnectionFinderConfig::default());

        let points = finder.connections_between("reforma", "juarez");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].node, 2);
        assert_eq!(points[0].street_a, "reforma");
        assert_eq!(points[0].street_b, "juarez");
    }

    #[test]
    fn near_miss_within_threshold() {
        let graph = fixture();
        let finder = ConnectionFinder::new(&graph, ConnectionFinderConfig::default());

        // Juarez and Hidalgo share no node; node 3 sits ~190 m from node 4
        let points = finder.connections_between("juarez", "hidalgo");
        let nodes: Vec<u64> = points.iter().map(|p| p.node).collect();
        assert!(nodes.contains(&3), "expected node 3 in {nodes:?}");
        assert!(nodes.contains(&4), "expected node 4 in {nodes:?}");
    }

    #[test]
    fn near_miss_respects_threshold() {
        let graph = fixture();
        let tight = ConnectionFinder::new(
            &graph,
            ConnectionFinderConfig {
                near_miss_threshold_m: 50.0,
            },
        );
        assert!(tight.connections_between("juarez", "hidalgo").is_empty());
    }

    #[test]
    fn leg_deduplicates_nodes_across_boundaries() {
        let graph = fixture();
        let finder = ConnectionFinder::new(&graph, ConnectionFinderConfig::default());

        let sets = vec![
            candidate_set("reforma", &["reforma"]),
            candidate_set("juarez", &["juarez"]),
            candidate_set("reforma", &["reforma"]),
        ];
        let boundaries = finder.connections_for_leg(&sets);
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].len(), 1);
        assert_eq!(boundaries[0][0].node, 2);
        // Node 2 was already emitted for the first boundary
        assert!(boundaries[1].is_empty());
    }

    #[test]
    fn empty_candidate_set_yields_empty_boundary() {
        let graph = fixture();
        let finder = ConnectionFinder::new(&graph, ConnectionFinderConfig::default());

        let sets = vec![
            candidate_set("reforma", &["reforma"]),
            candidate_set("retorno", &[]),
        ];
        let boundaries = finder.connections_for_leg(&sets);
        assert_eq!(boundaries.len(), 1);
        assert!(boundaries[0].is_empty());
    }
}
