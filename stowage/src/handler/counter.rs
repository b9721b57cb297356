//! Counter measurements (`|c`).
//!
//! Counter measurements are corrected for sample rate and summed across each
//! aggregation window; rollups sum the window sums.

use super::{Aggregate, StatPoint};

/// Counter aggregation.
#[derive(Debug, Clone, Copy)]
pub struct Counter;

impl Aggregate for Counter {
    type Acc = f64;

    fn prefix() -> &'static str {
        "counters"
    }

    fn empty() -> f64 {
        0.0
    }

    fn accumulate(acc: &mut f64, value: f64) {
        *acc += value;
    }

    fn fine_points(acc: &f64) -> Vec<StatPoint> {
        vec![(None, *acc)]
    }

    fn raw_samples(acc: &f64) -> Vec<f64> {
        vec![*acc]
    }

    fn rollup_points(values: &[f64]) -> Vec<StatPoint> {
        let value = if values.len() > 1 {
            values.iter().sum()
        } else {
            values[0]
        };
        vec![(None, value)]
    }
}
