//! Fakes for the seams of the probe logic: a [ProbeSender] that tracks instead of sending, and a
//!  [ProbeMetrics] implementation that records every call. They are part of the regular code so
//!  that they can be used for testing code built on top of this crate.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::metrics::{ProbeMetrics, ProbeTrip};
use crate::transponder::{ProbeSender, TransponderError};

#[derive(Debug, Default)]
pub struct TrackingProbeSender {
    tracker: Arc<RwLock<Vec<(SocketAddr, Vec<u8>)>>>,
    failing: AtomicBool,
}
impl TrackingProbeSender {
    pub fn new() -> Self {
        Default::default()
    }

    /// Make all subsequent sends fail with [TransponderError::NotRunning]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub async fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.tracker.read().await.clone()
    }

    /// Echoes are sent from spawned tasks, so tests need to wait for them
    pub async fn wait_for_sent(&self, count: usize) -> Vec<(SocketAddr, Vec<u8>)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let lock = self.tracker.read().await;
                if lock.len() >= count {
                    return lock.clone();
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("expected {} sent probes, was {:?}", count, self.sent().await);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn assert_nothing_sent(&self) {
        let sent = self.sent().await;
        assert!(sent.is_empty(), "expected nothing to be sent, was {:?}", sent);
    }
}

#[async_trait]
impl ProbeSender for TrackingProbeSender {
    async fn send(&self, buf: &[u8], to: SocketAddr) -> Result<(), TransponderError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(TransponderError::NotRunning);
        }
        self.tracker.write().await.push((to, buf.to_vec()));
        Ok(())
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum MetricsEvent {
    ProbeSent(String),
    ProbeReturned(ProbeTrip),
    FailedProbeSend { peer: String, error_type: String },
    FailedProbeRespond(String),
    InvalidProbe(String),
}

#[derive(Debug, Default)]
pub struct RecordingProbeMetrics {
    events: Mutex<Vec<MetricsEvent>>,
}
impl RecordingProbeMetrics {
    pub fn new() -> Self {
        Default::default()
    }

    fn record(&self, event: MetricsEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    pub fn events(&self) -> Vec<MetricsEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn returned(&self) -> Vec<ProbeTrip> {
        self.events().into_iter()
            .filter_map(|e| match e {
                MetricsEvent::ProbeReturned(trip) => Some(trip),
                _ => None,
            })
            .collect()
    }

    /// Returned probes are recorded by the receive loop, asynchronously from the test code
    pub async fn wait_for_returned(&self, count: usize) -> Vec<ProbeTrip> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let returned = self.returned();
            if returned.len() >= count {
                return returned;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("expected {} returned probes, events were {:?}", count, self.events());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl ProbeMetrics for RecordingProbeMetrics {
    fn probe_sent(&self, peer: &str) {
        self.record(MetricsEvent::ProbeSent(peer.to_string()));
    }

    fn probe_returned(&self, trip: &ProbeTrip) {
        self.record(MetricsEvent::ProbeReturned(trip.clone()));
    }

    fn failed_probe_send(&self, peer: &str, error_type: &str) {
        self.record(MetricsEvent::FailedProbeSend { peer: peer.to_string(), error_type: error_type.to_string() });
    }

    fn failed_probe_respond(&self, error_type: &str) {
        self.record(MetricsEvent::FailedProbeRespond(error_type.to_string()));
    }

    fn invalid_probe_received(&self, error_type: &str) {
        self.record(MetricsEvent::InvalidProbe(error_type.to_string()));
    }
}
