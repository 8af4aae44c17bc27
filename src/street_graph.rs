use geo::{Haversine, algorithm::Distance};
use geo_types::{Coord, Point};
use log::{debug, info, warn};
use ordered_float::OrderedFloat;
use osmpbf::{Element, ElementReader};
use petgraph::prelude::{DiGraphMap, UnGraphMap};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;
use std::time::Instant;

use crate::error::{Error, Result};

/// Attributes of one street edge between two intersection nodes.
///
/// An edge may carry more than one name label (compound intersections,
/// streets renamed mid-block).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeInfo {
    pub names: Vec<String>,
    /// Edge length in meters.
    pub length_m: f64,
    /// One-way in the u -> v direction.
    pub oneway: bool,
}

/// Edge record in the JSON network artifact.
#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkEdge {
    pub u: u64,
    pub v: u64,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub length_m: Option<f64>,
    #[serde(default)]
    pub oneway: bool,
}

/// JSON network artifact: nodes keyed by id with (lat, lon), plus an edge
/// list.
#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkFile {
    pub nodes: HashMap<u64, (f64, f64)>,
    pub edges: Vec<NetworkEdge>,
}

/// Serializable snapshot of a loaded network. Adjacency and the name index
/// are rebuilt on load.
#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    nodes: Vec<(u64, Coord<f64>)>,
    edges: Vec<(u64, u64, EdgeInfo)>,
}

/// A city street network, frozen after construction.
///
/// Exposes a directed view (path weights respect one-way streets) and an
/// undirected view (continuity checks during stitching). Coordinates are
/// stored x = lon, y = lat.
pub struct StreetGraph {
    nodes: HashMap<u64, Coord<f64>>,
    edges: HashMap<(u64, u64), EdgeInfo>,
    directed: DiGraphMap<u64, f64>,
    undirected: UnGraphMap<u64, f64>,
    /// Lowercased name label -> edges carrying it, in insertion order.
    name_index: HashMap<String, Vec<(u64, u64)>>,
}

/// Highway types considered drivable when loading from an OSM extract.
const DRIVABLE_HIGHWAY_TYPES: [&str; 13] = [
    "motorway",
    "trunk",
    "primary",
    "secondary",
    "tertiary",
    "motorway_link",
    "trunk_link",
    "primary_link",
    "secondary_link",
    "tertiary_link",
    "residential",
    "unclassified",
    "living_street",
];

impl StreetGraph {
    /// Build a frozen graph from raw node and edge collections.
    pub fn from_parts(nodes: HashMap<u64, Coord<f64>>, edge_list: Vec<(u64, u64, EdgeInfo)>) -> Self {
        let mut directed = DiGraphMap::new();
        let mut undirected = UnGraphMap::new();
        let mut edges = HashMap::new();
        let mut name_index: HashMap<String, Vec<(u64, u64)>> = HashMap::new();

        for &id in nodes.keys() {
            directed.add_node(id);
            undirected.add_node(id);
        }

        for (u, v, info) in edge_list {
            if !nodes.contains_key(&u) || !nodes.contains_key(&v) {
                warn!("Skipping edge ({u}, {v}): endpoint missing from node set");
                continue;
            }

            directed.add_edge(u, v, info.length_m);
            if !info.oneway {
                directed.add_edge(v, u, info.length_m);
            }
            undirected.add_edge(u, v, info.length_m);

            for name in &info.names {
                let key = name.to_lowercase();
                let entry = name_index.entry(key).or_default();
                if !entry.contains(&(u, v)) {
                    entry.push((u, v));
                }
            }

            edges.insert((u, v), info);
        }

        debug!(
            "Street graph frozen with {} nodes and {} edges",
            nodes.len(),
            edges.len()
        );

        Self {
            nodes,
            edges,
            directed,
            undirected,
            name_index,
        }
    }

    /// Load a network from the JSON artifact shape.
    pub fn from_json(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let network: NetworkFile = serde_json::from_reader(BufReader::new(file))?;

        let nodes: HashMap<u64, Coord<f64>> = network
            .nodes
            .into_iter()
            .map(|(id, (lat, lon))| (id, Coord { x: lon, y: lat }))
            .collect();

        let edge_list = network
            .edges
            .into_iter()
            .map(|e| {
                let length_m = e.length_m.unwrap_or_else(|| {
                    match (nodes.get(&e.u), nodes.get(&e.v)) {
                        (Some(a), Some(b)) => {
                            Haversine.distance(Point::from(*a), Point::from(*b))
                        }
                        _ => 0.0,
                    }
                });
                (
                    e.u,
                    e.v,
                    EdgeInfo {
                        names: e.names,
                        length_m,
                        oneway: e.oneway,
                    },
                )
            })
            .collect();

        Ok(Self::from_parts(nodes, edge_list))
    }

    /// Build the network from an OSM PBF extract.
    ///
    /// Two streaming passes: ways first (drivable highways, name and oneway
    /// tags), then the coordinates of the nodes those ways reference. Edges
    /// are created between consecutive way nodes with Haversine lengths.
    pub fn from_osm_pbf(path: &Path) -> Result<Self> {
        let start_time = Instant::now();
        let drivable: HashSet<&str> = DRIVABLE_HIGHWAY_TYPES.iter().copied().collect();

        struct WayEntry {
            nodes: Vec<u64>,
            names: Vec<String>,
            oneway: bool,
        }

        // Pass 1: collect drivable ways
        let mut ways: Vec<WayEntry> = Vec::new();
        let mut referenced: HashSet<u64> = HashSet::new();

        let reader =
            ElementReader::from_path(path).map_err(|e| Error::Osm(e.to_string()))?;
        reader
            .for_each(|element| {
                if let Element::Way(way) = element {
                    let mut highway = None;
                    let mut name = None;
                    let mut oneway = false;
                    for (key, value) in way.tags() {
                        match key {
                            "highway" => highway = Some(value.to_string()),
                            "name" => name = Some(value.to_string()),
                            "oneway" => oneway = value == "yes" || value == "1",
                            _ => {}
                        }
                    }

                    let Some(highway) = highway else { return };
                    if !drivable.contains(highway.as_str()) {
                        return;
                    }

                    let node_ids: Vec<u64> = way.refs().map(|id| id as u64).collect();
                    if node_ids.len() < 2 {
                        return;
                    }

                    referenced.extend(node_ids.iter().copied());
                    ways.push(WayEntry {
                        nodes: node_ids,
                        names: name.into_iter().collect(),
                        oneway,
                    });
                }
            })
            .map_err(|e| Error::Osm(e.to_string()))?;

        info!("Collected {} drivable ways from {:?}", ways.len(), path);

        // Pass 2: coordinates for referenced nodes only
        let mut nodes: HashMap<u64, Coord<f64>> = HashMap::with_capacity(referenced.len());
        let reader =
            ElementReader::from_path(path).map_err(|e| Error::Osm(e.to_string()))?;
        reader
            .for_each(|element| match element {
                Element::Node(node) => {
                    let id = node.id() as u64;
                    if referenced.contains(&id) {
                        nodes.insert(
                            id,
                            Coord {
                                x: node.lon(),
                                y: node.lat(),
                            },
                        );
                    }
                }
                Element::DenseNode(node) => {
                    let id = node.id() as u64;
                    if referenced.contains(&id) {
                        nodes.insert(
                            id,
                            Coord {
                                x: node.lon(),
                                y: node.lat(),
                            },
                        );
                    }
                }
                _ => {}
            })
            .map_err(|e| Error::Osm(e.to_string()))?;

        // Edges between consecutive way nodes
        let mut edge_list = Vec::new();
        for way in ways {
            for pair in way.nodes.windows(2) {
                let (u, v) = (pair[0], pair[1]);
                let (Some(a), Some(b)) = (nodes.get(&u), nodes.get(&v)) else {
                    continue;
                };
                let length_m = Haversine.distance(Point::from(*a), Point::from(*b));
                edge_list.push((
                    u,
                    v,
                    EdgeInfo {
                        names: way.names.clone(),
                        length_m,
                        oneway: way.oneway,
                    },
                ));
            }
        }

        info!(
            "OSM extract loaded in {:.2?}: {} nodes, {} edges",
            start_time.elapsed(),
            nodes.len(),
            edge_list.len()
        );

        Ok(Self::from_parts(nodes, edge_list))
    }

    /// Write a bincode snapshot of the network, skipping the expensive OSM
    /// parse on later runs.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = GraphSnapshot {
            nodes: self.nodes.iter().map(|(&id, &c)| (id, c)).collect(),
            edges: self
                .edges
                .iter()
                .map(|(&(u, v), info)| (u, v, info.clone()))
                .collect(),
        };

        let mut writer = BufWriter::new(File::create(path)?);
        let config = bincode::config::standard();
        bincode::serde::encode_into_std_write(&snapshot, &mut writer, config)
            .map_err(|e| Error::Snapshot(e.to_string()))?;
        debug!("Street graph snapshot written to {:?}", path);
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
        let config = bincode::config::standard();
        let (snapshot, _): (GraphSnapshot, usize) =
            bincode::serde::decode_from_slice(&bytes, config)
                .map_err(|e| Error::Snapshot(e.to_string()))?;

        Ok(Self::from_parts(
            snapshot.nodes.into_iter().collect(),
            snapshot.edges,
        ))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains_node(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_coord(&self, id: u64) -> Option<Point<f64>> {
        self.nodes.get(&id).map(|&c| Point::from(c))
    }

    /// Geodesic distance in meters between two nodes.
    pub fn node_distance_m(&self, a: u64, b: u64) -> Result<f64> {
        let pa = self.node_coord(a).ok_or(Error::NodeNotFound(a))?;
        let pb = self.node_coord(b).ok_or(Error::NodeNotFound(b))?;
        Ok(Haversine.distance(pa, pb))
    }

    /// Edges whose labels include `name`, case-insensitively.
    pub fn edges_with_name(&self, name: &str) -> &[(u64, u64)] {
        self.name_index
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes incident to any edge named `name`, in first-seen edge order.
    pub fn nodes_with_name(&self, name: &str) -> Vec<u64> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &(u, v) in self.edges_with_name(name) {
            if seen.insert(u) {
                out.push(u);
            }
            if seen.insert(v) {
                out.push(v);
            }
        }
        out
    }

    /// Name labels of the edge between `u` and `v`, in either stored
    /// direction.
    pub fn edge_names(&self, u: u64, v: u64) -> Option<&[String]> {
        self.edges
            .get(&(u, v))
            .or_else(|| self.edges.get(&(v, u)))
            .map(|info| info.names.as_slice())
    }

    /// All distinct street names in the network, lowercased and sorted.
    /// This is the gazetteer the name resolver matches against.
    pub fn street_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.name_index.keys().cloned().collect();
        names.sort();
        names
    }

    /// Length-weighted shortest path on the directed view.
    pub fn shortest_path(&self, from: u64, to: u64) -> Result<Vec<u64>> {
        self.dijkstra(from, to, true)
    }

    /// Length-weighted shortest path ignoring one-way restrictions.
    pub fn shortest_path_undirected(&self, from: u64, to: u64) -> Result<Vec<u64>> {
        self.dijkstra(from, to, false)
    }

    fn dijkstra(&self, from: u64, to: u64, directed: bool) -> Result<Vec<u64>> {
        if !self.nodes.contains_key(&from) {
            return Err(Error::NodeNotFound(from));
        }
        if !self.nodes.contains_key(&to) {
            return Err(Error::NodeNotFound(to));
        }
        if from == to {
            return Ok(vec![from]);
        }

        let mut open_set = BinaryHeap::new();
        let mut g_scores: HashMap<u64, f64> = HashMap::new();
        let mut came_from: HashMap<u64, u64> = HashMap::new();
        let mut closed_set: HashSet<u64> = HashSet::new();

        g_scores.insert(from, 0.0);
        open_set.push(Reverse((OrderedFloat(0.0), from)));

        while let Some(Reverse((OrderedFloat(cost), current))) = open_set.pop() {
            if current == to {
                // Reconstruct path
                let mut path = vec![to];
                let mut node = to;
                while let Some(&prev) = came_from.get(&node) {
                    path.push(prev);
                    node = prev;
                }
                path.reverse();
                return Ok(path);
            }

            if !closed_set.insert(current) {
                continue;
            }

            let neighbors: Vec<(u64, f64)> = if directed {
                self.directed
                    .edges(current)
                    .map(|(_, next, &w)| (next, w))
                    .collect()
            } else {
                self.undirected
                    .edges(current)
                    .map(|(_, next, &w)| (next, w))
                    .collect()
            };

            for (next, weight) in neighbors {
                if closed_set.contains(&next) {
                    continue;
                }
                let tentative = cost + weight;
                if tentative < *g_scores.get(&next).unwrap_or(&f64::INFINITY) {
                    g_scores.insert(next, tentative);
                    came_from.insert(next, current);
                    open_set.push(Reverse((OrderedFloat(tentative), next)));
                }
            }
        }

        Err(Error::NoPathFound { from, to })
    }

    /// Flatten a node path into coordinates.
    pub fn path_coordinates(&self, path: &[u64]) -> Vec<Point<f64>> {
        path.iter().filter_map(|&n| self.node_coord(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Small grid fixture:
    ///
    /// 1 -- 2 -- 3   ("reforma" along the top)
    ///      |
    ///      4        ("juarez" down from node 2)
    fn fixture() -> StreetGraph {
        let nodes = HashMap::from([
            (1, Coord { x: -99.10, y: 19.40 }),
            (2, Coord { x: -99.09, y: 19.40 }),
            (3, Coord { x: -99.08, y: 19.40 }),
            (4, Coord { x: -99.09, y: 19.39 }),
        ]);
        let edges = vec![
            (
                1,
                2,
                EdgeInfo {
                    names: vec!["Reforma".into()],
                    length_m: 1000.0,
                    oneway: false,
                },
            ),
            (
                2,
                3,
                EdgeInfo {
                    names: vec!["Reforma".into()],
                    length_m: 1000.0,
                    oneway: false,
                },
            ),
            (
                2,
                4,
                EdgeInfo {
                    names: vec!["Juarez".into()],
                    length_m: 1100.0,
                    oneway: true,
                },
            ),
        ];
        StreetGraph::from_parts(nodes, edges)
    }

    #[test]
    fn shortest_path_follows_edges() {
        let graph = fixture();
        let path = graph.shortest_path(1, 4).unwrap();
        assert_eq!(path, vec![1, 2, 4]);
    }

    #[test]
    fn oneway_blocks_reverse_direction() {
        let graph = fixture();
        // 2 -> 4 is one-way, so 4 -> 1 has no directed path
        let err = graph.shortest_path(4, 1).unwrap_err();
        assert!(matches!(err, Error::NoPathFound { from: 4, to: 1 }));
        // ...but the undirected view connects them
        let path = graph.shortest_path_undirected(4, 1).unwrap();
        assert_eq!(path, vec![4, 2, 1]);
    }

    #[test]
    fn unknown_node_is_reported() {
        let graph = fixture();
        assert!(matches!(
            graph.shortest_path(1, 99),
            Err(Error::NodeNotFound(99))
        ));
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let graph = fixture();
        assert_eq!(graph.edges_with_name("REFORMA").len(), 2);
        assert_eq!(graph.nodes_with_name("reforma"), vec![1, 2, 3]);
    }

    #[test]
    fn node_distance_is_meters() {
        let graph = fixture();
        let d = graph.node_distance_m(1, 2).unwrap();
        // ~0.01 degrees of longitude at 19.4 N is roughly a kilometer
        assert!(d > 800.0 && d < 1200.0, "unexpected distance {d}");
    }

    #[test]
    fn snapshot_round_trip() {
        let graph = fixture();
        let path = std::env::temp_dir().join("derrotero_graph_snapshot_test.bin");
        graph.save_snapshot(&path).unwrap();
        let restored = StreetGraph::load_snapshot(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(restored.node_count(), graph.node_count());
        assert_eq!(restored.edge_count(), graph.edge_count());
        assert_eq!(restored.shortest_path(1, 4).unwrap(), vec![1, 2, 4]);
    }
}
