use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::classifier::{CandidateGeometry, ClassificationRecord, VariantClassifier};
use crate::denoise::{DenoiseConfig, GpsPoint, GpsTrace, TraceDenoiser};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Fixed size of the classification worker pool.
    pub worker_threads: usize,
    pub denoise: DenoiseConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            denoise: DenoiseConfig::default(),
        }
    }
}

/// Results keyed by vehicle, then by date.
pub type BatchResults = BTreeMap<String, BTreeMap<NaiveDate, ClassificationRecord>>;

/// Classify every (vehicle, day) unit of a GPS feed against the candidate
/// branch geometries.
///
/// Units are independent: each one denoises and classifies its own trace
/// against the shared read-only candidates, so they run on a bounded
/// worker pool. A failing unit is recorded with its reason and never
/// aborts the batch.
pub fn classify_batch(
    feed: Vec<GpsPoint>,
    candidates: &[CandidateGeometry],
    config: &BatchConfig,
) -> Result<BatchResults> {
    let units = split_into_units(feed);
    info!(
        "Classifying {} (vehicle, day) unit(s) on {} worker(s)",
        units.len(),
        config.worker_threads
    );

    let pb = ProgressBar::new(units.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} - Classifying units")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads)
        .build()
        .map_err(|e| crate::error::Error::Io(std::io::Error::other(e.to_string())))?;

    let denoiser = TraceDenoiser::new(config.denoise.clone());

    let records: Vec<ClassificationRecord> = pool.install(|| {
        units
            .into_par_iter()
            .map(|(vehicle, date, points)| {
                let record = classify_unit(&vehicle, date, points, candidates, &denoiser);
                pb.inc(1);
                record
            })
            .collect()
    });

    pb.finish_and_clear();

    let mut results: BatchResults = BTreeMap::new();
    for record in records {
        results
            .entry(record.vehicle.clone())
            .or_default()
            .insert(record.date, record);
    }
    Ok(results)
}

/// Partition the feed into per-vehicle, per-calendar-day point groups,
/// vehicles and dates in sorted order.
fn split_into_units(feed: Vec<GpsPoint>) -> Vec<(String, NaiveDate, Vec<GpsPoint>)> {
    let mut grouped: BTreeMap<(String, NaiveDate), Vec<GpsPoint>> = BTreeMap::new();
    for point in feed {
        let key = (point.vehicle.clone(), point.time.date_naive());
        grouped.entry(key).or_default().push(point);
    }
    grouped
        .into_iter()
        .map(|((vehicle, date), points)| (vehicle, date, points))
        .collect()
}

fn classify_unit(
    vehicle: &str,
    date: NaiveDate,
    points: Vec<GpsPoint>,
    candidates: &[CandidateGeometry],
    denoiser: &TraceDenoiser,
) -> ClassificationRecord {
    let trace = GpsTrace::from_points(points);
    let denoised = denoiser.denoise(&trace);

    match VariantClassifier::new(candidates).classify(&denoised) {
        Ok(classification) => ClassificationRecord {
            vehicle: vehicle.to_string(),
            date,
            predicted_branch: Some(classification.predicted_branch),
            deviation: Some(classification.deviation),
            mean_deviation: Some(classification.mean_deviation),
            skip_reason: None,
        },
        Err(e) => {
            warn!("Skipping unit ({vehicle}, {date}): {e}");
            ClassificationRecord {
                vehicle: vehicle.to_string(),
                date,
                predicted_branch: None,
                deviation: None,
                mean_deviation: None,
                skip_reason: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn point(vehicle: &str, day: u32, minute: i64, lat: f64, lon: f64) -> GpsPoint {
        let time = Utc
            .with_ymd_and_hms(2023, 9, day, 8, 0, 0)
            .unwrap()
            + chrono::Duration::minutes(minute);
        GpsPoint::new(lat, lon, time, vehicle, "ruta 5")
    }

    fn candidates() -> Vec<CandidateGeometry> {
        let near = (0..20)
            .map(|i| [-99.10 + i as f64 * 0.0005, 19.40 + i as f64 * 0.0005])
            .collect();
        let far = (0..20)
            .map(|i| [-99.20 + i as f64 * 0.0005, 19.50 + i as f64 * 0.0005])
            .collect();
        vec![
            CandidateGeometry::new(1, near),
            CandidateGeometry::new(2, far),
        ]
    }

    fn unit_points(vehicle: &str, day: u32) -> Vec<GpsPoint> {
        (0..5)
            .map(|i| {
                point(
                    vehicle,
                    day,
                    i * 5,
                    19.40 + i as f64 * 0.0005,
                    -99.10 + i as f64 * 0.0005,
                )
            })
            .collect()
    }

    #[test]
    fn one_record_per_vehicle_and_day() {
        let mut feed = Vec::new();
        feed.extend(unit_points("0050034", 12));
        feed.extend(unit_points("0050034", 13));
        feed.extend(unit_points("0050284", 12));

        let results = classify_batch(feed, &candidates(), &BatchConfig::default()).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results["0050034"].len(), 2);
        assert_eq!(results["0050284"].len(), 1);

        let record = &results["0050034"][&NaiveDate::from_ymd_opt(2023, 9, 12).unwrap()];
        assert_eq!(record.predicted_branch, Some(1));
        assert!(record.skip_reason.is_none());
    }

    #[test]
    fn degenerate_unit_is_recorded_not_fatal() {
        let mut feed = unit_points("0050034", 12);
        // A second vehicle with a single fix that day
        feed.push(point("0050999", 12, 0, 19.40, -99.10));

        let results = classify_batch(feed, &candidates(), &BatchConfig::default()).unwrap();

        let skipped = &results["0050999"][&NaiveDate::from_ymd_opt(2023, 9, 12).unwrap()];
        assert!(skipped.predicted_branch.is_none());
        assert!(skipped.skip_reason.is_some());

        // The healthy unit still classified
        let healthy = &results["0050034"][&NaiveDate::from_ymd_opt(2023, 9, 12).unwrap()];
        assert_eq!(healthy.predicted_branch, Some(1));
    }
}
