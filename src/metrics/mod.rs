pub mod latency_buckets;
pub mod prometheus_metrics;

#[cfg(test)] use mockall::automock;

/// A probe that completed its round trip, evaluated from the timestamps it carries
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeTrip {
    pub peer: String,
    /// location of the node that sent the probe (i.e. our own)
    pub src_location: String,
    /// location of the peer as it reported it when stamping the probe
    pub dst_location: String,
    pub forward_latency_us: f64,
    pub return_latency_us: f64,
}

/// The outcomes of the probe protocol that are recorded as metrics. This is the probe logic's only
///  way of reporting statistics, so tests can substitute their own implementation.
#[cfg_attr(test, automock)]
pub trait ProbeMetrics: Send + Sync + 'static {
    fn probe_sent(&self, peer: &str);

    fn probe_returned(&self, trip: &ProbeTrip);

    fn failed_probe_send(&self, peer: &str, error_type: &str);

    fn failed_probe_respond(&self, error_type: &str);

    fn invalid_probe_received(&self, error_type: &str);
}
