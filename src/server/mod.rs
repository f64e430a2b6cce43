pub mod http;
pub mod probes;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics::prometheus_metrics::PrometheusMetrics;
use crate::peer::peer_registry::PeerRegistry;
use crate::probe::location::Location;
use crate::probe::NodeId;
use crate::server::http::{bind_http, run_http_server};
use crate::server::probes::ProbeEngine;
use crate::transponder::Transponder;
use crate::util::random::{Random, RngRandom};

/// Wires the transponder, the probe engine and the metrics server together, and runs them until
///  the process is signalled to stop or one of them fails
pub struct Server {
    config: Config,
    local_id: NodeId,
    location: Location,
    peers: Arc<PeerRegistry>,
    metrics: Arc<PrometheusMetrics>,
}

impl Server {
    pub fn new(config: Config) -> anyhow::Result<Server> {
        config.validate()?;

        let local_id = RngRandom::try_next_node_id()?;
        let location = Location::new(&config.metrics.location)?;
        let peers = Arc::new(PeerRegistry::build(local_id, &config.transponder.peers)?);
        let metrics = Arc::new(PrometheusMetrics::new(
            &config.metrics.labels,
            config.metrics.max_latency_us,
            config.metrics.latency_buckets_count,
        )?);

        info!(%local_id, %location, num_peers = peers.len(), "latency monitor configured");
        Ok(Server {
            config,
            local_id,
            location,
            peers,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Arc<PrometheusMetrics> {
        &self.metrics
    }

    /// Runs until SIGINT / SIGTERM is received or a component fails
    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `stop` completes or a component fails, and shuts down in order: the ticker first,
    ///  then the transponder, then the metrics server. Each step is bounded by the configured grace
    ///  period.
    pub async fn run_until(&self, stop: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
        let transponder = Arc::new(Transponder::new());
        transponder.open(&self.config.transponder.listen_address).await?;

        let http_listener = match bind_http(&self.config.metrics.listen_address).await {
            Ok(l) => l,
            Err(e) => {
                transponder.shutdown();
                return Err(e);
            }
        };

        let engine = Arc::new(ProbeEngine::new(
            self.local_id,
            self.location,
            self.peers.clone(),
            transponder.clone(),
            self.metrics.clone(),
        ));

        let (http_shutdown_sender, http_shutdown_receiver) = watch::channel(false);
        let (ticker_shutdown_sender, ticker_shutdown_receiver) = watch::channel(false);

        info!(listen_address = %self.config.transponder.listen_address, "latency monitor transponder is going up");
        let mut transponder_task = {
            let transponder = transponder.clone();
            let engine = engine.clone();
            tokio::spawn(async move { transponder.run(engine).await })
        };
        let mut http_task = tokio::spawn(run_http_server(http_listener, self.metrics.clone(), http_shutdown_receiver));
        let ticker_task = tokio::spawn(run_ticker(engine, self.config.transponder.interval, ticker_shutdown_receiver));

        let mut transponder_done = false;
        let mut http_done = false;
        let failure = select! {
            r = stop => {
                match r {
                    Ok(()) => None,
                    Err(e) => Some(e),
                }
            }
            r = &mut transponder_task => {
                transponder_done = true;
                Some(task_failure("transponder", r))
            }
            r = &mut http_task => {
                http_done = true;
                Some(task_failure("metrics server", r))
            }
        };
        match &failure {
            None => info!("stop signal received, shutting down"),
            Some(e) => error!(error = %e, "internal failure, shutting down"),
        }

        let grace = self.config.shutdown_grace_period;

        ticker_shutdown_sender.send_replace(true);
        stop_task("ticker", ticker_task, grace).await;

        transponder.shutdown();
        if !transponder_done {
            if let Some(Err(e)) = stop_task("transponder", transponder_task, grace).await {
                error!(error = %e, "error while shutting down the transponder");
            }
        }
        info!("latency monitor transponder is down");

        http_shutdown_sender.send_replace(true);
        if !http_done {
            if let Some(Err(e)) = stop_task("metrics server", http_task, grace).await {
                error!(error = %e, "error while shutting down the metrics server");
            }
        }
        info!("latency monitor metrics server is down");

        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Sends probes on every tick, the first tick one interval after start. Ticks that are due while
///  probes are still being sent are skipped.
async fn run_ticker(engine: Arc<ProbeEngine>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        select! {
            _ = ticks.tick() => engine.send_probes().await,
            _ = stopped(&mut shutdown) => {
                debug!("ticker stopped");
                return;
            }
        }
    }
}

/// Completes once `shutdown` turns true or its sender is gone. The borrowed value is released
///  before returning, which keeps the futures awaiting this `Send`.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&shut_down| shut_down).await;
}

fn task_failure<E: Into<anyhow::Error>>(name: &str, r: Result<Result<(), E>, tokio::task::JoinError>) -> anyhow::Error {
    match r {
        Ok(Ok(())) => anyhow!("{} terminated unexpectedly", name),
        Ok(Err(e)) => {
            let e: anyhow::Error = e.into();
            e.context(format!("{} failed", name))
        }
        Err(e) => anyhow!("{} task failed: {}", name, e),
    }
}

/// Waits for a task to finish for at most `grace`, aborting it after that
async fn stop_task<T>(name: &str, task: JoinHandle<T>, grace: Duration) -> Option<T> {
    let abort_handle = task.abort_handle();
    match timeout(grace, task).await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            error!(task = name, error = %e, "task failed during shutdown");
            None
        }
        Err(_) => {
            warn!(task = name, ?grace, "task did not stop within the grace period - aborting");
            abort_handle.abort();
            None
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!(signal = "SIGINT", "stop signal received");
        }
        _ = terminate.recv() => {
            info!(signal = "SIGTERM", "stop signal received");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "stop signal received");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use tokio::sync::oneshot;
    use tracing::Level;
    use uuid::Uuid;
    use crate::config::{LogConfig, LogMode, MetricsConfig, TransponderConfig};
    use crate::test_util::{RecordingProbeMetrics, TrackingProbeSender};
    use super::*;

    fn config(transponder_listen_address: &str, metrics_listen_address: &str, peers: Vec<String>) -> Config {
        Config {
            log: LogConfig { level: Level::DEBUG, mode: LogMode::Dev },
            metrics: MetricsConfig {
                listen_address: metrics_listen_address.to_string(),
                labels: [("env".to_string(), "test".to_string())].into(),
                location: "fra-1".to_string(),
                latency_buckets_count: 33,
                max_latency_us: 1_000_000,
            },
            transponder: TransponderConfig {
                interval: Duration::from_millis(20),
                listen_address: transponder_listen_address.to_string(),
                peers,
            },
            shutdown_grace_period: Duration::from_secs(5),
        }
    }

    /// the number of returned probes depends on timing, so only the series' existence is checked
    fn has_series(text: &str, name: &str, labels: &[&str]) -> bool {
        text.lines()
            .filter(|line| line.starts_with(&format!("{}{{", name)))
            .any(|line| labels.iter().all(|l| line.contains(l)))
    }

    fn free_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn test_new_invalid_config() {
        let config = config("127.0.0.1:0", "127.0.0.1:0", vec!["b".to_string()]);
        assert!(Server::new(config).is_err());
    }

    #[tokio::test]
    async fn test_measures_loopback_until_stopped() {
        let port = free_udp_port();
        let server = Arc::new(Server::new(config(
            &format!("127.0.0.1:{}", port),
            "127.0.0.1:0",
            vec![format!("localhost=127.0.0.1:{}", port)],
        )).unwrap());

        let (stop_sender, stop_receiver) = oneshot::channel::<()>();
        let running = {
            let server = server.clone();
            tokio::spawn(async move {
                server.run_until(async move {
                    let _ = stop_receiver.await;
                    Ok(())
                }).await
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let text = server.metrics().encode_text().unwrap();
            if has_series(&text, "latency_monitor_probe_returned_count", &[r#"env="test""#, r#"peer="localhost""#]) {
                assert!(has_series(&text, "latency_monitor_forward_trip_latency_count", &[r#"env="test""#, r#"location_from="fra-1""#, r#"location_to="fra-1""#, r#"peer="localhost""#]), "{}", text);
                break;
            }
            assert!(Instant::now() < deadline, "no probe returned: {}", text);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        stop_sender.send(()).unwrap();
        timeout(Duration::from_secs(10), running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ticker_runs_on_its_own_task_until_stopped() {
        let local_id = Uuid::from_u128(1);
        let registry = Arc::new(PeerRegistry::build(local_id, &["b=127.0.0.1:9".to_string()]).unwrap());
        let sender = Arc::new(TrackingProbeSender::new());
        let engine = Arc::new(ProbeEngine::new(local_id, Location::new("fra-1").unwrap(), registry, sender.clone(), Arc::new(RecordingProbeMetrics::new())));

        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let ticker = tokio::spawn(run_ticker(engine, Duration::from_millis(10), shutdown_receiver));

        let sent = timeout(Duration::from_secs(5), sender.wait_for_sent(2)).await.unwrap();
        assert!(sent.iter().all(|(to, _)| to.port() == 9));

        shutdown_sender.send_replace(true);
        timeout(Duration::from_secs(5), ticker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stopped_when_sender_is_dropped() {
        let (shutdown_sender, mut shutdown_receiver) = watch::channel(false);
        drop(shutdown_sender);
        timeout(Duration::from_secs(5), stopped(&mut shutdown_receiver)).await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_bind_failure() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let metrics_address = occupied.local_addr().unwrap().to_string();
        let server = Server::new(config("127.0.0.1:0", &metrics_address, vec![])).unwrap();

        let result = server.run_until(std::future::pending()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stop_error_is_returned() {
        let server = Server::new(config("127.0.0.1:0", "127.0.0.1:0", vec![])).unwrap();

        let result = server.run_until(async { Err(anyhow!("signal handler failed")) }).await;
        assert_eq!(result.unwrap_err().to_string(), "signal handler failed");
    }
}
