use super::*;

#[test]
fn counters_accumulate() {
    let metrics = Metrics::default();
    Metrics::incr(&metrics.requests_total);
    Metrics::incr(&metrics.requests_total);
    Metrics::add(&metrics.chunks_indexed, 40);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.requests_total, 2);
    assert_eq!(snapshot.chunks_indexed, 40);
    assert_eq!(snapshot.admission_rejections, 0);
}

#[test]
fn histogram_places_samples_in_buckets() {
    let histogram = LatencyHistogram::default();
    histogram.record(Duration::from_millis(3)); // <= 5
    histogram.record(Duration::from_millis(30)); // <= 50
    histogram.record(Duration::from_secs(10)); // overflow

    let snapshot = histogram.snapshot();
    assert_eq!(snapshot.count, 3);

    let bucket_for = |le: Option<u64>| {
        snapshot
            .buckets
            .iter()
            .find(|b| b.le_ms == le)
            .map(|b| b.count)
    };
    assert_eq!(bucket_for(Some(5)), Some(1));
    assert_eq!(bucket_for(Some(50)), Some(1));
    assert_eq!(bucket_for(None), Some(1));
}

#[test]
fn histogram_mean() {
    let histogram = LatencyHistogram::default();
    assert_eq!(histogram.snapshot().mean_ms, 0.0);

    histogram.record(Duration::from_millis(10));
    histogram.record(Duration::from_millis(30));
    assert!((histogram.snapshot().mean_ms - 20.0).abs() < 1e-9);
}
