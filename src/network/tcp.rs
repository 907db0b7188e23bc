use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::JsonCodec;
use super::registry::RegistryClient;
use super::{Directory, Link};
use crate::common::NetworkError;
use crate::snapshot::{Ingress, Message, PeerInfo, PeerName};

/*
    Wire format: length-prefixed JSON frames. The sender writes one `Message`
    and waits for one `Ack` before writing the next, so every send is a
    request/response pair and a single connection stays FIFO. Connecting and
    each exchange are bounded by the link timeout.
*/

/// Bound on connecting to a peer and on each message/ack exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` before trying again.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "ack", content = "reason", rename_all = "snake_case")]
pub enum Ack {
    Accepted,
    Rejected(String),
}

/// Retries `accept` until it succeeds, pausing after each failure so a
/// persistent error such as fd exhaustion does not spin.
pub(crate) async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                warn!(%err, backoff_ms = ACCEPT_BACKOFF.as_millis() as u64, "Failed to accept connection");
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Accepts connections from remote peers and feeds their messages into
/// `ingress`.
pub fn spawn_listener(listener: TcpListener, ingress: Ingress) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = accept_with_backoff(|| listener.accept()).await;
            debug!(%addr, "Accepted peer connection");
            let ingress = ingress.clone();
            drop(tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, ingress).await {
                    warn!(%addr, %err, "Peer connection failed");
                }
            }));
        }
    })
}

async fn handle_connection(stream: TcpStream, ingress: Ingress) -> Result<(), NetworkError> {
    let mut framed = Framed::new(stream, JsonCodec::<Message>::new());

    while let Some(frame) = framed.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                // The frame is unusable and the stream ends after a decode
                // error; tell the sender why before closing.
                let _ = framed.send(&Ack::Rejected(format!("malformed message: {}", err))).await;
                return Err(err);
            }
        };

        let ack = match ingress.deliver(message) {
            Ok(()) => Ack::Accepted,
            Err(err) => Ack::Rejected(err.to_string()),
        };

        let closing = matches!(ack, Ack::Rejected(_));
        framed.send(&ack).await?;
        if closing && ingress.is_closed() {
            break;
        }
    }

    Ok(())
}

pub struct TcpLink {
    peer: PeerName,
    framed: Framed<TcpStream, JsonCodec<Ack>>,
    timeout: Duration,
}

impl TcpLink {
    pub async fn connect(peer: &PeerInfo, limit: Duration) -> Result<Self, NetworkError> {
        let stream = timeout(limit, TcpStream::connect(peer.endpoint.as_str()))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connection to {}", peer.name)))??;
        stream.set_nodelay(true)?;

        Ok(TcpLink {
            peer: peer.name.clone(),
            framed: Framed::new(stream, JsonCodec::new()),
            timeout: limit,
        })
    }

    async fn exchange(&mut self, message: &Message) -> Result<(), NetworkError> {
        self.framed.send(message).await?;

        match self.framed.next().await.transpose()? {
            Some(Ack::Accepted) => Ok(()),
            Some(Ack::Rejected(reason)) => Err(NetworkError::Rejected(self.peer.clone(), reason)),
            None => Err(NetworkError::Closed(self.peer.clone())),
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn deliver(&mut self, message: &Message) -> Result<(), NetworkError> {
        let limit = self.timeout;
        let exchanged = timeout(limit, self.exchange(message)).await;
        exchanged.unwrap_or_else(|_| Err(NetworkError::Timeout(format!("acknowledgement from {}", self.peer))))
    }
}

/// Directory backed by the TCP registry; links are TCP connections to each
/// peer's registered endpoint.
pub struct TcpDirectory {
    registry: RegistryClient,
    timeout: Duration,
}

impl TcpDirectory {
    pub fn new(registry: SocketAddr) -> Self {
        TcpDirectory {
            registry: RegistryClient::new(registry),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bounds registry requests, connects and each message exchange.
    pub fn with_timeout(self, limit: Duration) -> Self {
        TcpDirectory {
            registry: self.registry.with_timeout(limit),
            timeout: limit,
        }
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }
}

#[async_trait]
impl Directory for TcpDirectory {
    async fn list(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        self.registry.list().await
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<Box<dyn Link>, NetworkError> {
        let link = TcpLink::connect(peer, self.timeout).await?;
        info!(to = %peer.name, endpoint = %peer.endpoint, "Connected to peer");
        Ok(Box::new(link))
    }
}
