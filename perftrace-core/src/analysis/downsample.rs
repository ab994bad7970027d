use crate::series::Point;

/// Reduces `points` to at most `2 * budget` points that keep the visual
/// envelope of the series.
///
/// The time span is split into `budget` equal-width buckets; each non-empty
/// bucket contributes its minimum and maximum point, in timestamp order, or
/// a single point when both are the same sample. A series that already fits
/// the budget is returned unchanged.
///
/// `points` must be in ascending timestamp order, as returned by
/// [`StoreReader::read_series`](crate::store::StoreReader::read_series).
pub fn downsample(points: &[Point], budget: usize) -> Vec<Point> {
    if points.len() <= budget {
        return points.to_vec();
    }
    if budget == 0 {
        return Vec::new();
    }

    let first = points[0].timestamp;
    let last = points[points.len() - 1].timestamp;
    // i128 keeps `offset * budget` exact over the whole i64 range.
    let width = i128::from(last) - i128::from(first) + 1;
    let buckets = budget as i128;
    let bucket_of = |t: i64| ((i128::from(t) - i128::from(first)) * buckets / width) as usize;

    let mut out = Vec::with_capacity(budget * 2);
    let mut start = 0;
    while start < points.len() {
        let bucket = bucket_of(points[start].timestamp);
        let mut end = start + 1;
        while end < points.len() && bucket_of(points[end].timestamp) == bucket {
            end += 1;
        }

        let (min, max) = envelope(&points[start..end]);
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        out.push(points[start + lo]);
        if hi != lo {
            out.push(points[start + hi]);
        }

        start = end;
    }

    out
}

/// Indices of the first minimum and first maximum of a non-empty slice.
fn envelope(points: &[Point]) -> (usize, usize) {
    let mut min = 0;
    let mut max = 0;
    for (i, point) in points.iter().enumerate().skip(1) {
        if point.value < points[min].value {
            min = i;
        }
        if point.value > points[max].value {
            max = i;
        }
    }
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<Point> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Point::new(1_000 + i as i64, *v))
            .collect()
    }

    #[test]
    fn test_identity_when_within_budget() {
        let points = series(&[1.0, 5.0, 2.0]);
        assert_eq!(downsample(&points, 3), points);
        assert_eq!(downsample(&points, 1000), points);
        assert!(downsample(&[], 10).is_empty());
    }

    #[test]
    fn test_zero_budget() {
        assert!(downsample(&series(&[1.0, 2.0]), 0).is_empty());
    }

    #[test]
    fn test_output_is_bounded_and_ordered() {
        let values: Vec<f64> = (0..10_000).map(|i| ((i * 37) % 101) as f64).collect();
        let points = series(&values);

        for budget in [1, 7, 100, 999] {
            let out = downsample(&points, budget);
            assert!(out.len() <= 2 * budget, "budget {}: {}", budget, out.len());
            assert!(out.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        }
    }

    #[test]
    fn test_deterministic() {
        let values: Vec<f64> = (0..5_000).map(|i| (i as f64 * 0.37).sin()).collect();
        let points = series(&values);
        assert_eq!(downsample(&points, 250), downsample(&points, 250));
    }

    #[test]
    fn test_spike_is_preserved() {
        let mut values = vec![1.0; 10_000];
        values[6_543] = 500.0;
        let out = downsample(&series(&values), 100);

        assert!(out.iter().any(|p| p.value == 500.0 && p.timestamp == 1_000 + 6_543));
    }

    #[test]
    fn test_flat_bucket_emits_one_point() {
        let out = downsample(&series(&[2.0; 10]), 5);
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|p| p.value == 2.0));
    }

    #[test]
    fn test_gaps_leave_empty_buckets() {
        let mut points = series(&[1.0, 2.0, 3.0]);
        points.extend([Point::new(10_000, 4.0), Point::new(10_001, 9.0)]);

        let out = downsample(&points, 4);
        // Buckets in the gap contribute nothing.
        assert_eq!(
            out,
            vec![
                Point::new(1_000, 1.0),
                Point::new(1_002, 3.0),
                Point::new(10_000, 4.0),
                Point::new(10_001, 9.0),
            ]
        );
    }

    #[test]
    fn test_min_before_max_in_time_order() {
        // Max comes first in time inside the only bucket.
        let points = series(&[9.0, 5.0, 1.0]);
        let out = downsample(&points, 1);
        assert_eq!(out, vec![Point::new(1_000, 9.0), Point::new(1_002, 1.0)]);
    }
}
