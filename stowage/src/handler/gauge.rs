//! Gauge measurements (`|g`).
//!
//! Gauge measurements are corrected for sample rate and stored
//! last-write-wins within a window; rollups take the arithmetic mean of the
//! window values.

use super::{Aggregate, StatPoint, stats};

/// Gauge aggregation.
#[derive(Debug, Clone, Copy)]
pub struct Gauge;

impl Aggregate for Gauge {
    type Acc = f64;

    fn prefix() -> &'static str {
        "gauges"
    }

    fn empty() -> f64 {
        0.0
    }

    fn accumulate(acc: &mut f64, value: f64) {
        *acc = value;
    }

    fn fine_points(acc: &f64) -> Vec<StatPoint> {
        vec![(None, *acc)]
    }

    fn raw_samples(acc: &f64) -> Vec<f64> {
        vec![*acc]
    }

    fn rollup_points(values: &[f64]) -> Vec<StatPoint> {
        vec![(None, stats::mean(values))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let mut acc = Gauge::empty();
        Gauge::accumulate(&mut acc, 4.0);
        Gauge::accumulate(&mut acc, 9.0);
        assert_eq!(Gauge::fine_points(&acc), vec![(None, 9.0)]);
    }

    #[test]
    fn rollups_average_the_window_values() {
        assert_eq!(Gauge::rollup_points(&[10.0, 20.0]), vec![(None, 15.0)]);
        assert_eq!(Gauge::rollup_points(&[7.5]), vec![(None, 7.5)]);
    }
}
