use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::JsonCodec;
use super::tcp::{accept_with_backoff, DEFAULT_TIMEOUT};
use crate::common::NetworkError;
use crate::snapshot::{PeerInfo, PeerName};

/*
    A minimal name service. Peers bind `name -> (pid, endpoint)` before the
    run starts and list the full membership once at start; the listing is
    then treated as static.
*/

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryRequest {
    Bind { peer: PeerInfo },
    List,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistryResponse {
    Bound,
    Peers { peers: Vec<PeerInfo> },
    Error { reason: String },
}

#[derive(Clone, Default)]
pub struct RegistryServer {
    entries: Arc<RwLock<BTreeMap<PeerName, PeerInfo>>>,
}

impl RegistryServer {
    pub fn new() -> Self {
        RegistryServer::default()
    }

    pub fn entries(&self) -> Vec<PeerInfo> {
        self.entries.read().values().cloned().collect()
    }

    /// Binds `peer`, replacing an earlier binding of the same name. A pid
    /// already held by a different name is refused.
    pub fn bind(&self, peer: PeerInfo) -> RegistryResponse {
        let mut entries = self.entries.write();

        if let Some(holder) = entries.values().find(|info| info.pid == peer.pid && info.name != peer.name) {
            return RegistryResponse::Error {
                reason: format!("pid {} is already bound to {}", peer.pid, holder.name),
            };
        }

        info!(name = %peer.name, pid = peer.pid, endpoint = %peer.endpoint, "Bound peer");
        let _ = entries.insert(peer.name.clone(), peer);
        RegistryResponse::Bound
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), NetworkError> {
        info!(addr = %listener.local_addr()?, "Registry listening");

        loop {
            let (stream, addr) = accept_with_backoff(|| listener.accept()).await;
            let server = self.clone();
            drop(tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    warn!(%addr, %err, "Registry connection failed");
                }
            }));
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), NetworkError> {
        let mut framed = Framed::new(stream, JsonCodec::<RegistryRequest>::new());

        while let Some(request) = framed.next().await.transpose()? {
            debug!(?request, "Registry request");
            let response = match request {
                RegistryRequest::Bind { peer } => self.bind(peer),
                RegistryRequest::List => RegistryResponse::Peers {
                    peers: self.entries(),
                },
            };
            framed.send(&response).await?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RegistryClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(addr: SocketAddr) -> Self {
        RegistryClient {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bounds each request, connect included.
    pub fn with_timeout(self, limit: Duration) -> Self {
        RegistryClient { timeout: limit, ..self }
    }

    pub async fn bind(&self, peer: PeerInfo) -> Result<(), NetworkError> {
        match self.request(&RegistryRequest::Bind { peer }).await? {
            RegistryResponse::Bound => Ok(()),
            RegistryResponse::Error { reason } => Err(NetworkError::Registry(reason)),
            other => Err(NetworkError::Registry(format!("unexpected response {:?}", other))),
        }
    }

    pub async fn list(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        match self.request(&RegistryRequest::List).await? {
            RegistryResponse::Peers { peers } => Ok(peers),
            RegistryResponse::Error { reason } => Err(NetworkError::Registry(reason)),
            other => Err(NetworkError::Registry(format!("unexpected response {:?}", other))),
        }
    }

    async fn request(&self, request: &RegistryRequest) -> Result<RegistryResponse, NetworkError> {
        timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| NetworkError::Timeout(format!("registry at {}", self.addr)))?
    }

    async fn exchange(&self, request: &RegistryRequest) -> Result<RegistryResponse, NetworkError> {
        let stream = TcpStream::connect(self.addr).await?;
        let mut framed = Framed::new(stream, JsonCodec::<RegistryResponse>::new());

        framed.send(request).await?;
        framed
            .next()
            .await
            .transpose()?
            .ok_or_else(|| NetworkError::Registry("registry closed the connection".to_owned()))
    }
}
