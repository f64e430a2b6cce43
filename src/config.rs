use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashSet;
use tracing::Level;

use crate::metrics::latency_buckets::latency_boundaries_us;
use crate::peer::Peer;
use crate::probe::location::Location;
use crate::server::http::parse_metrics_listen_address;
use crate::transponder::Transponder;

#[derive(Debug)]
pub struct Config {
    pub log: LogConfig,
    pub metrics: MetricsConfig,
    pub transponder: TransponderConfig,

    /// upper bound for each step of the shutdown sequence
    pub shutdown_grace_period: Duration,
}

#[derive(Debug)]
pub struct LogConfig {
    pub level: Level,
    pub mode: LogMode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap_derive::ValueEnum)]
pub enum LogMode {
    /// JSON lines
    Prod,
    /// human-readable
    Dev,
}

#[derive(Debug)]
pub struct MetricsConfig {
    pub listen_address: String,
    /// attached to every series
    pub labels: BTreeMap<String, String>,
    /// reported as 'from' and 'to' labels, at most 36 bytes
    pub location: String,
    pub latency_buckets_count: usize,
    pub max_latency_us: u64,
}

#[derive(Debug)]
pub struct TransponderConfig {
    pub interval: Duration,
    pub listen_address: String,
    /// `name=host:port`
    pub peers: Vec<String>,
}

impl Config {
    /// Checks everything that can be checked before the server starts, so that misconfiguration
    ///  fails at startup rather than on the first tick
    pub fn validate(&self) -> anyhow::Result<()> {
        self.metrics.validate()?;
        self.transponder.validate()?;
        if self.shutdown_grace_period.is_zero() {
            bail!("shutdown grace period must be positive");
        }
        Ok(())
    }
}

impl MetricsConfig {
    fn validate(&self) -> anyhow::Result<()> {
        parse_metrics_listen_address(&self.listen_address)?;
        Location::new(&self.location)?;
        latency_boundaries_us(self.max_latency_us, self.latency_buckets_count)?;
        Ok(())
    }
}

impl TransponderConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            bail!("transponder interval must be positive");
        }
        Transponder::parse_listen_address(&self.listen_address)?;

        let mut names = FxHashSet::default();
        for descriptor in &self.peers {
            let peer = Peer::from_str(descriptor)?;
            if !names.insert(peer.name().to_string()) {
                bail!("duplicate peer name: {}", peer.name());
            }
        }
        Ok(())
    }
}

/// Parses `label=value` pairs
pub fn parse_labels(raw: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    for s in raw {
        let (label, value) = s.split_once('=')
            .ok_or_else(|| anyhow!("invalid metrics label, expected 'label=value': {}", s))?;
        if label.is_empty() {
            bail!("invalid metrics label, empty label name: {}", s);
        }
        if result.insert(label.to_string(), value.to_string()).is_some() {
            bail!("duplicate metrics label: {}", label);
        }
    }
    Ok(result)
}
