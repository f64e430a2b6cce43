use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::probe::PROBE_SIZE;

#[derive(Debug, Error)]
pub enum TransponderError {
    #[error("malformed listen address: {0}")]
    MalformedListenAddress(String),
    #[error("transponder is already serving")]
    AlreadyServing,
    #[error("transponder was shut down")]
    AlreadyShutDown,
    #[error("transponder is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
impl TransponderError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransponderError::MalformedListenAddress(_) => "malformed_listen_address",
            TransponderError::AlreadyServing => "already_serving",
            TransponderError::AlreadyShutDown => "already_shut_down",
            TransponderError::NotRunning => "not_running",
            TransponderError::Io(_) => "io",
        }
    }
}

/// Sends a single datagram without waiting for any kind of confirmation.
///
/// This decouples the probe logic from the actual socket for testing.
#[async_trait::async_trait]
pub trait ProbeSender: Send + Sync + 'static {
    async fn send(&self, buf: &[u8], to: SocketAddr) -> Result<(), TransponderError>;
}

/// Called by the receive loop for every datagram it reads. This is a blocking call, holding up the
///  receive loop, so implementations must offload anything that waits.
pub trait DatagramHandler: Send + Sync {
    fn on_datagram(&self, buf: &[u8], from: SocketAddr);
}

enum TransponderState {
    Idle,
    Open(Arc<UdpSocket>),
    Closed,
}

/// Owns the UDP socket that probes are sent from and received on.
///
/// Lifecycle: [Transponder::open] binds the socket, [Transponder::run] is the receive loop, and
///  [Transponder::shutdown] releases the socket and terminates the receive loop. A transponder can
///  not be reopened after it was shut down.
pub struct Transponder {
    state: Mutex<TransponderState>,
    shutdown_sender: watch::Sender<bool>,
}

impl Default for Transponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transponder {
    pub fn new() -> Transponder {
        let (shutdown_sender, _) = watch::channel(false);
        Transponder {
            state: Mutex::new(TransponderState::Idle),
            shutdown_sender,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TransponderState> {
        // the state is only ever replaced as a whole, so a poisoned lock still holds a valid state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parses a `host:port` listen address where host is a literal IP address
    pub fn parse_listen_address(listen_address: &str) -> Result<SocketAddr, TransponderError> {
        let malformed = || TransponderError::MalformedListenAddress(listen_address.to_string());

        let parts = listen_address.split(':').collect::<Vec<_>>();
        if parts.len() != 2 {
            return Err(malformed());
        }

        let ip = parts[0].parse::<IpAddr>().map_err(|_| malformed())?;
        let port = parts[1].parse::<u16>().map_err(|_| malformed())?;
        Ok(SocketAddr::new(ip, port))
    }

    pub async fn open(&self, listen_address: &str) -> Result<(), TransponderError> {
        let addr = Self::parse_listen_address(listen_address)?;

        self.check_can_open()?;
        let socket = UdpSocket::bind(addr).await?;

        // re-check: the lock can not be held across the bind
        let mut state = self.lock_state();
        match *state {
            TransponderState::Idle => {
                info!(addr = ?socket.local_addr()?, "transponder socket bound");
                *state = TransponderState::Open(Arc::new(socket));
                Ok(())
            }
            TransponderState::Open(_) => Err(TransponderError::AlreadyServing),
            TransponderState::Closed => Err(TransponderError::AlreadyShutDown),
        }
    }

    fn check_can_open(&self) -> Result<(), TransponderError> {
        match *self.lock_state() {
            TransponderState::Idle => Ok(()),
            TransponderState::Open(_) => Err(TransponderError::AlreadyServing),
            TransponderState::Closed => Err(TransponderError::AlreadyShutDown),
        }
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        match &*self.lock_state() {
            TransponderState::Open(socket) => Some(socket.clone()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), TransponderState::Open(_))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransponderError> {
        let socket = self.socket().ok_or(TransponderError::NotRunning)?;
        Ok(socket.local_addr()?)
    }

    /// Receives datagrams and passes them to the handler until [Transponder::shutdown] is called.
    ///  A read error that is not caused by a shutdown terminates the loop and is returned.
    pub async fn run(&self, handler: Arc<dyn DatagramHandler>) -> Result<(), TransponderError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let socket = match self.socket() {
            Some(socket) => socket,
            None => {
                if *shutdown_receiver.borrow() {
                    return Ok(());
                }
                return Err(TransponderError::NotRunning);
            }
        };

        // a datagram longer than a probe is truncated to the probe size and handled like any other
        let mut buf = [0u8; PROBE_SIZE];

        debug!("starting transponder receive loop");
        loop {
            select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            trace!(len, ?from, "received datagram");
                            handler.on_datagram(&buf[..len], from);
                        }
                        Err(e) => {
                            if !self.is_running() {
                                return Ok(());
                            }
                            error!(error = ?e, "error while reading UDP");
                            return Err(e.into());
                        }
                    }
                }
                _ = shutdown_receiver.wait_for(|&shut_down| shut_down) => {
                    debug!("transponder receive loop was shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Fire and forget: a sent datagram may still get lost
    pub async fn send(&self, buf: &[u8], to: SocketAddr) -> Result<(), TransponderError> {
        let socket = self.socket().ok_or(TransponderError::NotRunning)?;
        socket.send_to(buf, to).await?;
        Ok(())
    }

    /// Idempotent. Releases the socket and terminates a running receive loop.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if matches!(*state, TransponderState::Closed) {
                return;
            }
            *state = TransponderState::Closed;
        }
        self.shutdown_sender.send_replace(true);
        debug!("transponder shut down");
    }
}

#[async_trait::async_trait]
impl ProbeSender for Transponder {
    async fn send(&self, buf: &[u8], to: SocketAddr) -> Result<(), TransponderError> {
        Transponder::send(self, buf, to).await
    }
}
