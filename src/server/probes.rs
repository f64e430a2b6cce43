use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::metrics::{ProbeMetrics, ProbeTrip};
use crate::peer::peer_registry::PeerRegistry;
use crate::peer::Peer;
use crate::probe::location::Location;
use crate::probe::timestamp::Timestamp;
use crate::probe::{NodeId, Probe};
use crate::transponder::{DatagramHandler, ProbeSender};

pub const ERR_UNEXPECTED_DESTINATION: &str = "unexpected_destination";
pub const ERR_IDENTIFIER_MISMATCH: &str = "identifier_mismatch";

/// What became of a received datagram
#[derive(Debug, PartialEq)]
pub enum ReceivedProbe {
    /// a peer's probe, stamped and ready to be sent back to where it came from
    Echo {
        reply: Bytes,
        to: SocketAddr,
    },
    /// one of our own probes completed its round trip
    Returned(ProbeTrip),
    /// recorded as a metric and discarded
    Dropped,
}

/// The probe protocol: sends a probe to every peer on each tick, echoes other nodes' probes, and
///  evaluates our own probes when they come back.
///
/// All timing information travels inside the probe, so there is no state for probes in flight.
///  Probes that get lost simply never show up in the statistics.
pub struct ProbeEngine {
    local_id: NodeId,
    location: Location,
    location_label: String,
    peers: Arc<PeerRegistry>,
    sender: Arc<dyn ProbeSender>,
    metrics: Arc<dyn ProbeMetrics>,
}

impl ProbeEngine {
    pub fn new(local_id: NodeId, location: Location, peers: Arc<PeerRegistry>, sender: Arc<dyn ProbeSender>, metrics: Arc<dyn ProbeMetrics>) -> ProbeEngine {
        ProbeEngine {
            local_id,
            location_label: location.to_string(),
            location,
            peers,
            sender,
            metrics,
        }
    }

    /// Sends one probe to each peer. Failures are recorded per peer and do not affect other peers.
    ///
    /// NB: This must not be called concurrently with itself, see [Peer::next_sequence]
    pub async fn send_probes(&self) {
        for (peer_id, peer) in self.peers.iter() {
            if let Err(error_type) = self.send_probe(*peer_id, peer).await {
                self.metrics.failed_probe_send(peer.name(), error_type);
            }
        }
    }

    async fn send_probe(&self, peer_id: NodeId, peer: &Peer) -> Result<(), &'static str> {
        let addr = peer.udp_addr().await
            .map_err(|e| {
                error!(peer = %peer.name(), error = %e, "failed to send a probe");
                e.kind()
            })?;

        let probe = Probe {
            sequence: peer.next_sequence(),
            src_id: self.local_id,
            src_timestamp: Timestamp::now(),
            src_location: self.location,
            dst_id: peer_id,
            ..Default::default()
        };

        let buf = probe.encode()
            .map_err(|e| {
                error!(peer = %peer.name(), error = %e, "failed to prepare a probe");
                e.kind()
            })?;

        self.sender.send(&buf, addr).await
            .map_err(|e| {
                error!(peer = %peer.name(), ?addr, error = %e, "failed to send a probe");
                e.kind()
            })?;

        self.metrics.probe_sent(peer.name());
        debug!(peer = %peer.name(), sequence = probe.sequence, ?addr, "sent a probe");
        Ok(())
    }

    /// Classifies a received datagram and records the outcome. `now` is the time of reception.
    ///
    /// Sending an echo is left to the caller: this is called from the receive loop, which must not
    ///  wait for the socket.
    pub fn on_received(&self, buf: &[u8], source: SocketAddr, now: Timestamp) -> ReceivedProbe {
        let mut probe = match Probe::decode(buf) {
            Ok(probe) => probe,
            Err(e) => {
                error!(?source, payload = ?buf, error = %e, "invalid probe");
                self.metrics.invalid_probe_received(e.kind());
                return ReceivedProbe::Dropped;
            }
        };
        trace!(?source, ?probe, "received probe");

        // stamp-and-echo is checked first: for the loopback peer, both ids are our own
        if probe.dst_id == self.local_id && probe.dst_timestamp.is_zero() {
            probe.dst_timestamp = now;
            probe.dst_location = self.location;
            return match probe.encode() {
                Ok(reply) => ReceivedProbe::Echo { reply, to: source },
                Err(e) => {
                    error!(?source, error = %e, "failed to prepare response to a probe");
                    self.metrics.failed_probe_respond(e.kind());
                    ReceivedProbe::Dropped
                }
            };
        }

        if probe.src_id == self.local_id {
            let Some(peer) = self.peers.get(&probe.dst_id) else {
                error!(?source, dst_id = %probe.dst_id, "invalid return probe: unexpected destination id");
                self.metrics.invalid_probe_received(ERR_UNEXPECTED_DESTINATION);
                return ReceivedProbe::Dropped;
            };

            let trip = ProbeTrip {
                peer: peer.name().to_string(),
                src_location: probe.src_location.to_string(),
                dst_location: probe.dst_location.to_string(),
                forward_latency_us: probe.dst_timestamp.micros_since(&probe.src_timestamp) as f64,
                return_latency_us: now.micros_since(&probe.dst_timestamp) as f64,
            };
            debug!(
                peer = %trip.peer,
                sequence = probe.sequence,
                forward_latency_us = trip.forward_latency_us,
                return_latency_us = trip.return_latency_us,
                "received a return probe",
            );
            self.metrics.probe_returned(&trip);
            return ReceivedProbe::Returned(trip);
        }

        error!(?source, src_id = %probe.src_id, dst_id = %probe.dst_id, "invalid probe: source is not us, destination is not us or already stamped");
        self.metrics.invalid_probe_received(ERR_IDENTIFIER_MISMATCH);
        ReceivedProbe::Dropped
    }

    fn spawn_echo(&self, reply: Bytes, to: SocketAddr) {
        let sender = self.sender.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = sender.send(&reply, to).await {
                error!(?to, error = %e, "failed to respond to a probe");
                metrics.failed_probe_respond(e.kind());
            }
        });
    }
}

impl DatagramHandler for ProbeEngine {
    fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        if let ReceivedProbe::Echo { reply, to } = self.on_received(buf, from, Timestamp::now()) {
            self.spawn_echo(reply, to);
        }
    }
}
