//! Timer measurements (`|ms`).
//!
//! Timer measurements collect into a sample list per window and reduce to a
//! fixed statistic set -- count, min, max, mean, nearest-rank 90th
//! percentile and, given more than one sample, the sample standard
//! deviation. Rollups compute the same set over the drained raw samples.

use super::{Aggregate, StatPoint, stats};

/// Timer aggregation.
#[derive(Debug, Clone, Copy)]
pub struct Timer;

fn statistic_set(values: &[f64]) -> Vec<StatPoint> {
    let count = values.len();
    let mean = stats::mean(values);
    let mut points = vec![
        (Some("mean"), mean),
        (Some("count"), count as f64),
        (Some("min"), stats::min(values)),
        (Some("max"), stats::max(values)),
        (Some("upper_90"), stats::upper_90(values)),
    ];
    if count > 1 {
        points.push((Some("stddev"), stats::stddev(values, mean)));
    }
    points
}

impl Aggregate for Timer {
    type Acc = Vec<f64>;

    fn prefix() -> &'static str {
        "timers"
    }

    // A timer line without a value is a no-op, not an error.
    fn requires_value() -> bool {
        false
    }

    fn corrects_for_rate() -> bool {
        false
    }

    fn empty() -> Vec<f64> {
        Vec::new()
    }

    fn accumulate(acc: &mut Vec<f64>, value: f64) {
        acc.push(value);
    }

    fn fine_points(acc: &Vec<f64>) -> Vec<StatPoint> {
        statistic_set(acc)
    }

    fn raw_samples(acc: &Vec<f64>) -> Vec<f64> {
        acc.clone()
    }

    fn rollup_points(values: &[f64]) -> Vec<StatPoint> {
        if values.len() > 1 {
            return statistic_set(values);
        }
        // A single drained sample stands in for every statistic that still
        // applies; stddev needs a second sample and is skipped.
        let value = values[0];
        vec![
            (Some("mean"), value),
            (Some("count"), value),
            (Some("min"), value),
            (Some("max"), value),
            (Some("upper_90"), value),
        ]
    }
}
