use anyhow::bail;

/// Histogram bucket boundaries (in microseconds) that are evenly spaced in log-space, from 1 up
///  to `max_latency_us`, rounded to the nearest 0.5:
///
/// `boundary[i] = round(2 * base^i) / 2` with `base = max_latency_us ^ (1 / (buckets_count - 1))`
///
/// NB: For dense configurations, rounding can produce the same value for adjacent boundaries at
///      the low end. They are returned as calculated.
pub fn latency_boundaries_us(max_latency_us: u64, buckets_count: usize) -> anyhow::Result<Vec<f64>> {
    if buckets_count < 2 {
        bail!("latency histogram needs at least 2 buckets, was configured with {}", buckets_count);
    }
    if max_latency_us < 1 {
        bail!("max latency must be at least 1us");
    }

    let base = ((max_latency_us as f64).ln() / (buckets_count - 1) as f64).exp();

    let result = (0..buckets_count)
        .map(|i| (2.0 * base.powf(i as f64)).round() / 2.0)
        .collect();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_eleven_buckets() {
        let boundaries = latency_boundaries_us(1_000_000, 11).unwrap();

        assert_eq!(boundaries, vec![
            1.0, 4.0, 16.0, 63.0, 251.0, 1000.0, 3981.0, 15849.0, 63095.5, 251188.5, 1000000.0,
        ]);
    }

    #[rstest]
    #[case::two(1_000_000, 2)]
    #[case::default(1_000_000, 33)]
    #[case::small(1000, 5)]
    #[case::tiny(2, 2)]
    fn test_strictly_increasing(#[case] max_latency_us: u64, #[case] buckets_count: usize) {
        let boundaries = latency_boundaries_us(max_latency_us, buckets_count).unwrap();

        assert_eq!(boundaries.len(), buckets_count);
        assert_eq!(boundaries[0], 1.0);
        assert_eq!(*boundaries.last().unwrap(), max_latency_us as f64);
        assert!(boundaries.windows(2).all(|w| w[0] < w[1]), "{:?}", boundaries);
    }

    #[test]
    fn test_rounds_to_half() {
        let boundaries = latency_boundaries_us(1_000_000, 33).unwrap();
        assert_eq!(&boundaries[..3], &[1.0, 1.5, 2.5]);
        assert!(boundaries.iter().all(|b| (b * 2.0).fract() == 0.0));
    }

    #[test]
    fn test_dense_buckets_may_repeat() {
        let boundaries = latency_boundaries_us(10, 100).unwrap();
        assert_eq!(boundaries.len(), 100);
        assert_eq!(boundaries[0], boundaries[1]);
    }

    #[rstest]
    #[case::zero_buckets(1_000_000, 0)]
    #[case::one_bucket(1_000_000, 1)]
    #[case::zero_latency(0, 10)]
    fn test_invalid(#[case] max_latency_us: u64, #[case] buckets_count: usize) {
        assert!(latency_boundaries_us(max_latency_us, buckets_count).is_err());
    }
}
