use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::metrics::prometheus_metrics::PrometheusMetrics;
use crate::server::stopped;

/// Parses a `host:port` listen address. The host may be a name or a literal IP address, and an
///  empty host (`:8080`) listens on all interfaces.
pub fn parse_metrics_listen_address(listen_address: &str) -> anyhow::Result<String> {
    let (host, port) = listen_address.rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid metrics listen address, expected 'host:port': {}", listen_address))?;
    let port = port.parse::<u16>()
        .with_context(|| format!("invalid metrics listen address port: {}", listen_address))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

pub async fn bind_http(listen_address: &str) -> anyhow::Result<TcpListener> {
    let addr = parse_metrics_listen_address(listen_address)?;
    let listener = TcpListener::bind(addr.as_str()).await
        .with_context(|| format!("failed to bind metrics server to {}", addr))?;
    info!("metrics server listening on http://{}", listener.local_addr()?);
    Ok(listener)
}

/// Serves the health check and the metrics until `shutdown` turns true. Connections that are open
///  at that point are closed gracefully.
pub async fn run_http_server(listener: TcpListener, metrics: Arc<PrometheusMetrics>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    loop {
        let (stream, remote_addr) = select! {
            r = listener.accept() => r?,
            _ = stopped(&mut shutdown) => {
                debug!("metrics server stopped accepting connections");
                return Ok(());
            }
        };

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        let mut shutdown = shutdown.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(handle(&req, &metrics)) }
            });

            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            let result = select! {
                r = conn.as_mut() => r,
                _ = stopped(&mut shutdown) => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                error!(?remote_addr, error = ?e, "error serving connection");
            }
        });
    }
}

fn handle(req: &Request<Incoming>, metrics: &PrometheusMetrics) -> Response<Full<Bytes>> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => new_response(StatusCode::OK, Bytes::new()),
        (&Method::GET, "/metrics") => match metrics.encode_text() {
            Ok(text) => {
                let mut response = new_response(StatusCode::OK, Bytes::from(text));
                response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                response
            }
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                new_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
            }
        },
        _ => new_response(StatusCode::NOT_FOUND, Bytes::new()),
    };

    debug!(method = %req.method(), uri = %req.uri(), status = response.status().as_u16(), "http request");
    response
}

fn new_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use crate::metrics::prometheus_metrics::tests::has_sample;
    use crate::metrics::ProbeMetrics;
    use super::*;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path).as_bytes()).await.unwrap();
        let mut response = String::new();
        timeout(Duration::from_secs(5), stream.read_to_string(&mut response)).await.unwrap().unwrap();
        response
    }

    #[tokio::test]
    async fn test_routes() {
        let metrics = Arc::new(PrometheusMetrics::new(&BTreeMap::new(), 1_000_000, 11).unwrap());
        metrics.probe_sent("b");

        let listener = bind_http("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let server = tokio::spawn(run_http_server(listener, metrics, shutdown_receiver));

        let health = get(addr, "/").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{}", health);

        let text = get(addr, "/metrics").await;
        assert!(text.starts_with("HTTP/1.1 200"), "{}", text);
        assert!(has_sample(&text, "latency_monitor_probe_sent_count", &[r#"peer="b""#], "1"), "{}", text);

        let not_found = get(addr, "/other").await;
        assert!(not_found.starts_with("HTTP/1.1 404"), "{}", not_found);

        shutdown_sender.send_replace(true);
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[rstest]
    #[case::ip4("0.0.0.0:8080", Some("0.0.0.0:8080"))]
    #[case::host_name("localhost:8080", Some("localhost:8080"))]
    #[case::empty_host(":8080", Some("0.0.0.0:8080"))]
    #[case::ip6("[::1]:8080", Some("[::1]:8080"))]
    #[case::no_port("localhost", None)]
    #[case::invalid_port("localhost:http", None)]
    #[case::port_out_of_range(":65536", None)]
    fn test_parse_metrics_listen_address(#[case] listen_address: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_metrics_listen_address(listen_address).ok().as_deref(), expected);
    }

    #[tokio::test]
    async fn test_bind_host_name() {
        let listener = bind_http("localhost:0").await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_empty_host() {
        let listener = bind_http(":0").await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_unspecified());
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        assert!(bind_http("localhost").await.is_err());
    }
}
