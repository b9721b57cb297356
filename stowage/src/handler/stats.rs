//! Statistic helpers shared by the handlers.
//!
//! Every function takes the complete, unordered sample set for a window;
//! none is sensitive to input order, which is what lets batch dispatch
//! interleave freely.

/// Arithmetic mean of a non-empty sample set.
pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Smallest sample.
pub(crate) fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

/// Largest sample.
pub(crate) fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Nearest-rank 90th percentile: sort ascending, take the element at 1-based
/// rank `ceil(0.9 * count)`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn upper_90(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = ((0.9 * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank - 1]
}

/// Sample standard deviation, dividing by `count - 1`. Callers guarantee at
/// least two samples.
pub(crate) fn stddev(values: &[f64], mean: f64) -> f64 {
    let squared: f64 = values.iter().map(|value| (value - mean).powi(2)).sum();
    (squared / (values.len() - 1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ten_sample_reference_values() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert!((mean(&values) - 5.5).abs() < 1e-9);
        assert!((min(&values) - 1.0).abs() < 1e-9);
        assert!((max(&values) - 10.0).abs() < 1e-9);
        // rank ceil(0.9 * 10) = 9, so the ninth element.
        assert!((upper_90(&values) - 9.0).abs() < 1e-9);
        assert!((stddev(&values, 5.5) - 3.027_650_354_097_491_6).abs() < 1e-9);
    }

    #[test]
    fn percentile_rank_rounds_up() {
        // ceil(0.9 * 5) = 5: the largest of five samples.
        assert!((upper_90(&[5.0, 1.0, 4.0, 2.0, 3.0]) - 5.0).abs() < 1e-9);
        // A single sample is its own percentile.
        assert!((upper_90(&[7.0]) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_ignores_input_order() {
        let sorted = upper_90(&[1.0, 2.0, 3.0, 4.0]);
        let shuffled = upper_90(&[4.0, 1.0, 3.0, 2.0]);
        assert!((sorted - shuffled).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn statistics_stay_within_sample_bounds(
            values in prop::collection::vec(-1_000_000.0f64..1_000_000.0, 1..100)
        ) {
            let lo = min(&values);
            let hi = max(&values);
            let m = mean(&values);
            let p = upper_90(&values);

            prop_assert!(lo <= hi);
            prop_assert!(m >= lo - 1e-6 && m <= hi + 1e-6);
            prop_assert!(values.contains(&p));
            prop_assert!(p >= lo && p <= hi);

            if values.len() > 1 {
                prop_assert!(stddev(&values, m) >= 0.0);
            }
        }
    }
}
