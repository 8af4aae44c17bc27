use chrono::NaiveDate;
use log::debug;
use rstar::RTree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::denoise::GpsTrace;
use crate::error::{Error, Result};
use crate::stitcher::RouteVariant;
use crate::street_graph::StreetGraph;

/// The scoreable geometry of one branch: every reconstructed coordinate of
/// the branch (both directions merged), indexed for nearest-point queries.
pub struct CandidateGeometry {
    pub branch: u32,
    tree: RTree<[f64; 2]>,
    point_count: usize,
}

impl CandidateGeometry {
    pub fn new(branch: u32, points: Vec<[f64; 2]>) -> Self {
        let point_count = points.len();
        Self {
            branch,
            tree: RTree::bulk_load(points),
            point_count,
        }
    }

    /// Merge the stitched variants of one branch into a single scoreable
    /// geometry, the shape classification compares traces against.
    pub fn from_variants(branch: u32, variants: &[&RouteVariant], graph: &StreetGraph) -> Self {
        let mut points = Vec::new();
        for variant in variants {
            points.extend(
                variant
                    .geometry(graph)
                    .into_iter()
                    .map(|p| [p.x(), p.y()]),
            );
        }
        Self::new(branch, points)
    }

    pub fn is_empty(&self) -> bool {
        self.point_count == 0
    }

    /// Minimum distance from a point to this geometry, in coordinate
    /// degrees. Relative scores are what classification compares, so the
    /// degree metric matches the denoiser's.
    fn min_distance(&self, lon: f64, lat: f64) -> f64 {
        self.tree
            .nearest_neighbor(&[lon, lat])
            .map(|nearest| {
                let dx = nearest[0] - lon;
                let dy = nearest[1] - lat;
                (dx * dx + dy * dy).sqrt()
            })
            .unwrap_or(f64::INFINITY)
    }

    /// Summed minimum distance over every trace point.
    pub fn summed_distance(&self, trace: &GpsTrace) -> f64 {
        trace
            .points
            .iter()
            .map(|p| self.min_distance(p.lon, p.lat))
            .sum()
    }
}

/// Group stitched variants by branch into candidate geometries, ordered by
/// branch number.
pub fn candidates_from_variants(
    variants: &[RouteVariant],
    graph: &StreetGraph,
) -> Vec<CandidateGeometry> {
    let mut by_branch: BTreeMap<u32, Vec<&RouteVariant>> = BTreeMap::new();
    for variant in variants {
        by_branch.entry(variant.branch).or_default().push(variant);
    }
    by_branch
        .into_iter()
        .map(|(branch, group)| CandidateGeometry::from_variants(branch, &group, graph))
        .collect()
}

/// Outcome of classifying one trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub predicted_branch: u32,
    /// Summed point-to-geometry distance, coordinate degrees.
    pub deviation: f64,
    /// Deviation per trace point, comparable across traces of different
    /// length.
    pub mean_deviation: f64,
}

/// Per-(vehicle, day) record emitted by the batch layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub vehicle: String,
    pub date: NaiveDate,
    pub predicted_branch: Option<u32>,
    pub deviation: Option<f64>,
    pub mean_deviation: Option<f64>,
    /// Why the unit was skipped, when it was.
    pub skip_reason: Option<String>,
}

/// Scores a denoised trace against every candidate branch geometry and
/// picks the arg-min.
pub struct VariantClassifier<'c> {
    candidates: &'c [CandidateGeometry],
}

impl<'c> VariantClassifier<'c> {
    pub fn new(candidates: &'c [CandidateGeometry]) -> Self {
        Self { candidates }
    }

    /// Classify one trace.
    ///
    /// The trace must reference exactly one route id; mixing routes is a
    /// caller error, not something to resolve silently. Ties on the summed
    /// distance keep the first candidate in iteration order.
    pub fn classify(&self, trace: &GpsTrace) -> Result<Classification> {
        if self.candidates.is_empty() {
            return Err(Error::NoVariants);
        }

        let route_ids = trace.route_ids();
        if route_ids.len() > 1 {
            return Err(Error::AmbiguousRouteInput(route_ids));
        }

        if trace.len() < 2 {
            return Err(Error::DegenerateTrace {
                points: trace.len(),
            });
        }

        let mut best: Option<(&CandidateGeometry, f64)> = None;
        for candidate in self.candidates {
            let sum = candidate.summed_distance(trace);
            debug!(
                "Branch {} scored {:.6} over {} points",
                candidate.branch,
                sum,
                trace.len()
            );
            match best {
                Some((_, best_sum)) if sum >= best_sum => {}
                _ => best = Some((candidate, sum)),
            }
        }

        let (winner, deviation) = best.unwrap();
        Ok(Classification {
            predicted_branch: winner.branch,
            deviation,
            mean_deviation: deviation / trace.len() as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denoise::GpsPoint;
    use chrono::{TimeZone, Utc};

    fn trace_near(lat: f64, lon: f64, route: &str) -> GpsTrace {
        let points = (0..5)
            .map(|i| {
                GpsPoint::new(
                    lat + i as f64 * 0.0005,
                    lon + i as f64 * 0.0005,
                    Utc.timestamp_opt(1_694_500_000 + i * 60, 0).unwrap(),
                    "0050034",
                    route,
                )
            })
            .collect();
        GpsTrace::from_points(points)
    }

    fn geometry_near(branch: u32, lat: f64, lon: f64) -> CandidateGeometry {
        let points = (0..20)
            .map(|i| [lon + i as f64 * 0.0005, lat + i as f64 * 0.0005])
            .collect();
        CandidateGeometry::new(branch, points)
    }

    #[test]
    fn picks_the_nearby_branch() {
        let candidates = vec![
            geometry_near(1, 19.40, -99.10),
            geometry_near(2, 19.50, -99.20),
        ];
        let classifier = VariantClassifier::new(&candidates);

        let trace = trace_near(19.40, -99.10, "ruta 5");
        let result = classifier.classify(&trace).unwrap();

        assert_eq!(result.predicted_branch, 1);
        assert!(result.deviation < 1e-9, "deviation {}", result.deviation);
        // The losing branch really is worse
        assert!(candidates[1].summed_distance(&trace) > result.deviation);
    }

    #[test]
    fn tie_breaks_to_first_candidate() {
        let candidates = vec![
            geometry_near(7, 19.40, -99.10),
            geometry_near(3, 19.40, -99.10),
        ];
        let classifier = VariantClassifier::new(&candidates);

        let result = classifier
            .classify(&trace_near(19.40, -99.10, "ruta 5"))
            .unwrap();
        assert_eq!(result.predicted_branch, 7);
    }

    #[test]
    fn mean_deviation_divides_by_point_count() {
        let candidates = vec![geometry_near(1, 19.40, -99.10)];
        let classifier = VariantClassifier::new(&candidates);

        let trace = trace_near(19.41, -99.10, "ruta 5");
        let result = classifier.classify(&trace).unwrap();
        let expected = result.deviation / trace.len() as f64;
        assert!((result.mean_deviation - expected).abs() < 1e-12);
    }

    #[test]
    fn mixed_route_ids_are_rejected() {
        let candidates = vec![geometry_near(1, 19.40, -99.10)];
        let classifier = VariantClassifier::new(&candidates);

        let mut trace = trace_near(19.40, -99.10, "ruta 5");
        trace.points[3].route = "ruta 8".to_string();

        let err = classifier.classify(&trace).unwrap_err();
        match err {
            Error::AmbiguousRouteInput(ids) => {
                assert_eq!(ids, vec!["ruta 5".to_string(), "ruta 8".to_string()])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn degenerate_trace_is_rejected() {
        let candidates = vec![geometry_near(1, 19.40, -99.10)];
        let classifier = VariantClassifier::new(&candidates);

        let mut trace = trace_near(19.40, -99.10, "ruta 5");
        trace.points.truncate(1);

        assert!(matches!(
            classifier.classify(&trace),
            Err(Error::DegenerateTrace { points: 1 })
        ));
    }

    #[test]
    fn no_candidates_is_an_error() {
        let classifier = VariantClassifier::new(&[]);
        assert!(matches!(
            classifier.classify(&trace_near(19.40, -99.10, "ruta 5")),
            Err(Error::NoVariants)
        ));
    }
}
