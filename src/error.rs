//! Error types for route reconstruction and trace classification.

/// Result type alias used throughout the core modules.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error taxonomy.
///
/// Reconstruction errors are scoped to the smallest unit that can fail (a
/// token boundary, a leg) and never abort sibling branches. Classification
/// errors are scoped to one (vehicle, date) unit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No path exists between two nodes in the street graph.
    #[error("no path found between node {from} and node {to}")]
    NoPathFound { from: u64, to: u64 },

    /// A node id referenced by a connection is not present in the graph.
    #[error("node {0} not found in street graph")]
    NodeNotFound(u64),

    /// An extracted street-name token could not be resolved to any known
    /// street. Non-fatal: the caller receives an empty candidate set.
    #[error("unresolved street-name token: {0:?}")]
    UnresolvedToken(String),

    /// A trace handed to the classifier mixes more than one route id.
    #[error("trace mixes route ids: {0:?}")]
    AmbiguousRouteInput(Vec<String>),

    /// A trace has too few points to classify after denoising.
    #[error("degenerate trace: {points} point(s) after denoising")]
    DegenerateTrace { points: usize },

    /// The remote gazetteer kept failing after the configured retries.
    #[error("gazetteer unavailable after {attempts} attempt(s): {reason}")]
    GazetteerUnavailable { attempts: u32, reason: String },

    /// The classifier was given no candidate geometries to score against.
    #[error("no route variants available for classification")]
    NoVariants,

    /// I/O error while reading or writing an artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure while parsing an OSM extract.
    #[error("OSM extract error: {0}")]
    Osm(String),

    /// Corrupt or incompatible street-graph snapshot.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Malformed JSON artifact.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed CSV artifact.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
