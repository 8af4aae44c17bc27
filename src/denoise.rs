use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

/// Weight every raw fix starts with; amplified when several fixes collapse
/// into one representative.
pub const BASE_POINT_WEIGHT: f64 = 2.0;

/// One GPS fix from the vehicle feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsPoint {
    pub lat: f64,
    pub lon: f64,
    pub time: DateTime<Utc>,
    pub vehicle: String,
    pub route: String,
    pub weight: f64,
}

impl GpsPoint {
    pub fn new(lat: f64, lon: f64, time: DateTime<Utc>, vehicle: &str, route: &str) -> Self {
        Self {
            lat,
            lon,
            time,
            vehicle: vehicle.to_string(),
            route: route.to_string(),
            weight: BASE_POINT_WEIGHT,
        }
    }
}

/// Time-ordered fixes for one vehicle on one calendar day.
#[derive(Debug, Clone, Default)]
pub struct GpsTrace {
    pub points: Vec<GpsPoint>,
}

impl GpsTrace {
    /// Build a trace, restoring time order if the feed delivered fixes out
    /// of sequence.
    pub fn from_points(mut points: Vec<GpsPoint>) -> Self {
        points.sort_by_key(|p| p.time);
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Distinct route ids referenced by the trace.
    pub fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for p in &self.points {
            if !ids.contains(&p.route) {
                ids.push(p.route.clone());
            }
        }
        ids
    }
}

#[derive(Debug, Clone)]
pub struct DenoiseConfig {
    /// Decimal places coordinates are rounded to when collapsing
    /// duplicates.
    pub rounding_precision: u32,
    /// Width of the temporal deduplication window, seconds.
    pub time_window_s: i64,
    /// How many points the forward-nearest filter looks ahead.
    pub lookahead: usize,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            rounding_precision: 4,
            time_window_s: 120,
            lookahead: 3,
        }
    }
}

/// Reduces a raw trace to representative points.
///
/// Stage A collapses coordinate duplicates inside consecutive time
/// windows, so an idling vehicle stops flooding the trace while
/// out-and-back passes over the same street survive in both directions.
/// Stage B walks the trace forward, always jumping to the nearest of the
/// next few points, which suppresses single-fix jitter spikes.
pub struct TraceDenoiser {
    config: DenoiseConfig,
}

impl TraceDenoiser {
    pub fn new(config: DenoiseConfig) -> Self {
        Self { config }
    }

    pub fn denoise(&self, trace: &GpsTrace) -> GpsTrace {
        if trace.len() < 2 {
            return trace.clone();
        }

        let grouped = self.group_within_windows(&trace.points);
        let filtered = self.forward_nearest(grouped);

        debug!(
            "Denoised trace: {} -> {} points",
            trace.len(),
            filtered.len()
        );
        GpsTrace { points: filtered }
    }

    /// Stage A: temporal deduplication.
    ///
    /// Each window starts at the first not-yet-consumed point and extends
    /// forward by the configured width; windows never overlap. Points
    /// sharing a rounded coordinate collapse to their earliest-index
    /// representative, whose weight is multiplied by the group size.
    fn group_within_windows(&self, points: &[GpsPoint]) -> Vec<GpsPoint> {
        let window = Duration::seconds(self.config.time_window_s);
        let mut out = Vec::new();
        let mut start_index = 0;

        while start_index < points.len() {
            let end_time = points[start_index].time + window;
            let mut end_index = start_index;
            while end_index < points.len() && points[end_index].time <= end_time {
                end_index += 1;
            }

            if end_index == start_index {
                // Clock anomaly guard: never stall the cursor
                start_index += 1;
                continue;
            }

            out.extend(self.collapse_window(&points[start_index..end_index]));
            start_index = end_index;
        }

        out
    }

    /// Collapse one window's points by rounded coordinate, preserving
    /// original order and coordinates of the representatives.
    fn collapse_window(&self, window: &[GpsPoint]) -> Vec<GpsPoint> {
        let factor = 10f64.powi(self.config.rounding_precision as i32);

        let mut groups: Vec<((i64, i64), GpsPoint, usize)> = Vec::new();
        for point in window {
            let key = (
                (point.lat * factor).round() as i64,
                (point.lon * factor).round() as i64,
            );
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, count)) => *count += 1,
                None => groups.push((key, point.clone(), 1)),
            }
        }

        groups
            .into_iter()
            .map(|(_, mut representative, count)| {
                representative.weight *= count as f64;
                representative
            })
            .collect()
    }

    /// Stage B: forward-nearest filter. Starting at the first point, jump
    /// to whichever of the next `lookahead` points lies geometrically
    /// closest, and repeat from there. Forward-only, so it terminates in
    /// O(n * lookahead).
    fn forward_nearest(&self, points: Vec<GpsPoint>) -> Vec<GpsPoint> {
        if points.len() < 2 || self.config.lookahead == 0 {
            return points;
        }

        let mut selected = vec![0usize];
        let mut i = 0;
        while i < points.len() - 1 {
            let end = (i + 1 + self.config.lookahead).min(points.len());
            let mut best = i + 1;
            let mut best_distance = f64::INFINITY;
            for (j, candidate) in points.iter().enumerate().take(end).skip(i + 1) {
                let dx = candidate.lon - points[i].lon;
                let dy = candidate.lat - points[i].lat;
                let distance = (dx * dx + dy * dy).sqrt();
                if distance < best_distance {
                    best_distance = distance;
                    best = j;
                }
            }
            i = best;
            selected.push(i);
        }

        selected.into_iter().map(|idx| points[idx].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_694_500_000 + seconds, 0).unwrap()
    }

    fn point(lat: f64, lon: f64, seconds: i64) -> GpsPoint {
        GpsPoint::new(lat, lon, t(seconds), "0050034", "ruta 5")
    }

    fn denoiser(precision: u32, window_s: i64, lookahead: usize) -> TraceDenoiser {
        TraceDenoiser::new(DenoiseConfig {
            rounding_precision: precision,
            time_window_s: window_s,
            lookahead,
        })
    }

    #[test]
    fn window_collapse_amplifies_weight() {
        // Two fixes at the same spot a second apart, a third well outside
        // the window: the first pair collapses with doubled weight.
        let trace = GpsTrace::from_points(vec![
            point(19.40, -99.10, 0),
            point(19.40, -99.10, 1),
            point(19.41, -99.11, 200),
        ]);

        let out = denoiser(2, 120, 3).denoise(&trace);
        assert_eq!(out.len(), 2);
        assert_eq!(out.points[0].weight, 2.0 * BASE_POINT_WEIGHT);
        assert_eq!(out.points[1].weight, BASE_POINT_WEIGHT);
    }

    #[test]
    fn output_never_longer_than_input() {
        let trace = GpsTrace::from_points(
            (0..50)
                .map(|i| point(19.40 + (i % 7) as f64 * 0.0001, -99.10, i * 10))
                .collect(),
        );
        let out = denoiser(4, 120, 3).denoise(&trace);
        assert!(out.len() <= trace.len());
    }

    #[test]
    fn denoising_is_idempotent() {
        let trace = GpsTrace::from_points(vec![
            point(19.400, -99.100, 0),
            point(19.400, -99.100, 5),
            point(19.401, -99.101, 130),
            point(19.402, -99.102, 260),
            point(19.403, -99.103, 390),
        ]);

        let d = denoiser(4, 120, 3);
        let once = d.denoise(&trace);
        let twice = d.denoise(&once);

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.points.iter().zip(twice.points.iter()) {
            assert_eq!((a.lat, a.lon, a.time), (b.lat, b.lon, b.time));
        }
    }

    #[test]
    fn jitter_spike_is_skipped() {
        // A single wild fix in the middle of a smooth run: the forward
        // nearest walk steps around it.
        let trace = GpsTrace::from_points(vec![
            point(19.4000, -99.1000, 0),
            point(19.9000, -99.9000, 130), // spike
            point(19.4001, -99.1001, 260),
            point(19.4002, -99.1002, 390),
        ]);

        let out = denoiser(4, 120, 3).denoise(&trace);
        assert!(
            out.points.iter().all(|p| p.lat < 19.5),
            "spike survived: {:?}",
            out.points
        );
    }

    #[test]
    fn out_and_back_survives_windowing() {
        // Same street traversed out and back outside one window: both
        // passes must survive for direction-sensitive classification.
        let trace = GpsTrace::from_points(vec![
            point(19.400, -99.100, 0),
            point(19.401, -99.101, 10),
            point(19.402, -99.102, 200),
            point(19.401, -99.101, 400),
            point(19.400, -99.100, 410),
        ]);

        let out = denoiser(4, 120, 1).denoise(&trace);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn short_traces_pass_through() {
        let trace = GpsTrace::from_points(vec![point(19.40, -99.10, 0)]);
        let out = denoiser(4, 120, 3).denoise(&trace);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn from_points_restores_time_order() {
        let trace = GpsTrace::from_points(vec![point(19.41, -99.11, 100), point(19.40, -99.10, 0)]);
        assert!(trace.points[0].time < trace.points[1].time);
    }
}
