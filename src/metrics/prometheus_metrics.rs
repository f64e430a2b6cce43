use std::collections::{BTreeMap, HashMap};

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::debug;

use crate::metrics::latency_buckets::latency_boundaries_us;
use crate::metrics::{ProbeMetrics, ProbeTrip};

pub const METRICS_NAMESPACE: &str = "latency_monitor";

/// [ProbeMetrics] backed by a Prometheus registry. Every series carries the operator's labels
///  as constant labels.
pub struct PrometheusMetrics {
    registry: Registry,

    probe_sent_count: IntCounterVec,
    probe_returned_count: IntCounterVec,

    failed_probe_send_count: IntCounterVec,
    failed_probe_respond_count: IntCounterVec,
    invalid_probes_count: IntCounterVec,

    forward_trip_latency: HistogramVec,
    return_trip_latency: HistogramVec,
}

impl PrometheusMetrics {
    pub fn new(labels: &BTreeMap<String, String>, max_latency_us: u64, latency_buckets_count: usize) -> anyhow::Result<PrometheusMetrics> {
        let const_labels = labels.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<HashMap<_, _>>();
        let registry = Registry::new_custom(Some(METRICS_NAMESPACE.to_string()), Some(const_labels))?;

        let mut boundaries = latency_boundaries_us(max_latency_us, latency_buckets_count)?;
        // Prometheus requires strictly increasing boundaries
        boundaries.dedup();
        debug!(?boundaries, "latency histogram boundaries");

        let counter = |name: &str, help: &str, label_names: &[&str]| -> anyhow::Result<IntCounterVec> {
            let counter = IntCounterVec::new(Opts::new(name, help), label_names)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let histogram = |name: &str, help: &str| -> anyhow::Result<HistogramVec> {
            let histogram = HistogramVec::new(
                HistogramOpts::new(name, help).buckets(boundaries.clone()),
                &["peer", "location_from", "location_to"],
            )?;
            registry.register(Box::new(histogram.clone()))?;
            Ok(histogram)
        };

        let probe_sent_count = counter("probe_sent_count", "count of successfully sent probes", &["peer"])?;
        let probe_returned_count = counter("probe_returned_count", "count of successfully returned probes", &["peer"])?;
        let failed_probe_send_count = counter("failed_probe_send_count", "count of failing to send a probe", &["peer", "error_type"])?;
        let failed_probe_respond_count = counter("failed_probe_respond_count", "count of failing to respond to a probe", &["error_type"])?;
        let invalid_probes_count = counter("invalid_probes_count", "count of receiving an invalid probe", &["error_type"])?;
        let forward_trip_latency = histogram("forward_trip_latency", "statistics on the latency of probes' forward-trip in microseconds")?;
        let return_trip_latency = histogram("return_trip_latency", "statistics on the latency of probes' return-trip in microseconds")?;

        Ok(PrometheusMetrics {
            registry,
            probe_sent_count,
            probe_returned_count,
            failed_probe_send_count,
            failed_probe_respond_count,
            invalid_probes_count,
            forward_trip_latency,
            return_trip_latency,
        })
    }

    /// All metrics in Prometheus' text exposition format
    pub fn encode_text(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

impl ProbeMetrics for PrometheusMetrics {
    fn probe_sent(&self, peer: &str) {
        self.probe_sent_count.with_label_values(&[peer]).inc();
    }

    fn probe_returned(&self, trip: &ProbeTrip) {
        self.forward_trip_latency
            .with_label_values(&[trip.peer.as_str(), trip.src_location.as_str(), trip.dst_location.as_str()])
            .observe(trip.forward_latency_us);
        self.return_trip_latency
            .with_label_values(&[trip.peer.as_str(), trip.dst_location.as_str(), trip.src_location.as_str()])
            .observe(trip.return_latency_us);
        self.probe_returned_count.with_label_values(&[trip.peer.as_str()]).inc();
    }

    fn failed_probe_send(&self, peer: &str, error_type: &str) {
        self.failed_probe_send_count.with_label_values(&[peer, error_type]).inc();
    }

    fn failed_probe_respond(&self, error_type: &str) {
        self.failed_probe_respond_count.with_label_values(&[error_type]).inc();
    }

    fn invalid_probe_received(&self, error_type: &str) {
        self.invalid_probes_count.with_label_values(&[error_type]).inc();
    }
}
