use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, eyre, Result as EyreResult, WrapErr};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{error::Elapsed, sleep, timeout};
use tracing::{info, warn};

use crate::common::NodeError;
use crate::network::{spawn_listener, Directory, LocalDirectory, Node, TcpDirectory};
use crate::snapshot::{ChannelSink, LocalSnapshot, LogHook, PeerInfo, PeerName, Pid};

/// Upper bound for the random pause before each background message.
const MAX_JITTER_MS: u64 = 50;

#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub peers: u64,
    pub initiator: Pid,
    pub messages: usize,
    pub delay: Duration,
    pub timeout: Duration,
}

impl WorkloadConfig {
    pub fn validate(&self) -> EyreResult<()> {
        if self.peers == 0 {
            bail!("at least one peer is required");
        }
        if self.initiator >= self.peers {
            bail!("initiator {} is not one of the {} peers", self.initiator, self.peers);
        }
        Ok(())
    }
}

/// A set of nodes started in this process, with every completed snapshot
/// funnelled into one receiver.
pub struct Mesh {
    pub nodes: Vec<Arc<Node>>,
    pub snapshots: UnboundedReceiver<LocalSnapshot>,
    listeners: Vec<JoinHandle<()>>,
}

impl Mesh {
    /// Peers wired through an in-process directory.
    pub async fn local(peers: u64) -> Result<Self, NodeError> {
        let directory = Arc::new(LocalDirectory::new());
        let (tx, snapshots) = unbounded_channel();
        let sink = Arc::new(ChannelSink::new(tx));

        let mut nodes = Vec::new();
        for pid in 0..peers {
            let info = PeerInfo::new(pid, PeerName::new(pid.to_string()), format!("local://{}", pid));
            let node = Node::new(info.clone(), directory.clone(), Arc::new(LogHook), sink.clone());
            directory.bind(info, node.ingress());
            nodes.push(Arc::new(node));
        }

        for node in &nodes {
            node.start().await?;
        }

        Ok(Mesh {
            nodes,
            snapshots,
            listeners: Vec::new(),
        })
    }

    /// Peers reachable over TCP at `host:start_port + pid`, published in the
    /// registry at `registry`. `limit` bounds every registry request, connect
    /// and message exchange. If setup fails, whatever was already started is
    /// torn down again.
    pub async fn tcp(
        registry: SocketAddr,
        host: IpAddr,
        start_port: u16,
        peers: u64,
        limit: Duration,
    ) -> EyreResult<Self> {
        let directory = Arc::new(TcpDirectory::new(registry).with_timeout(limit));
        let (tx, snapshots) = unbounded_channel();
        let sink = Arc::new(ChannelSink::new(tx));

        let mut mesh = Mesh {
            nodes: Vec::new(),
            snapshots,
            listeners: Vec::new(),
        };

        if let Err(err) = mesh.spawn_tcp(&directory, &sink, host, start_port, peers).await {
            mesh.shutdown().await;
            return Err(err);
        }

        Ok(mesh)
    }

    async fn spawn_tcp(
        &mut self,
        directory: &Arc<TcpDirectory>,
        sink: &Arc<ChannelSink>,
        host: IpAddr,
        start_port: u16,
        peers: u64,
    ) -> EyreResult<()> {
        for pid in 0..peers {
            let port = u16::try_from(pid)
                .ok()
                .and_then(|offset| start_port.checked_add(offset))
                .ok_or_else(|| eyre!("port range starting at {} is too small for {} peers", start_port, peers))?;
            let endpoint = SocketAddr::new(host, port);

            let listener = TcpListener::bind(endpoint)
                .await
                .wrap_err_with(|| format!("failed to listen on {}", endpoint))?;
            let info = PeerInfo::new(pid, PeerName::new(pid.to_string()), endpoint.to_string());
            let node = Node::new(
                info.clone(),
                directory.clone() as Arc<dyn Directory>,
                Arc::new(LogHook),
                sink.clone(),
            );

            self.listeners.push(spawn_listener(listener, node.ingress()));
            self.nodes.push(Arc::new(node));
            directory
                .registry()
                .bind(info)
                .await
                .wrap_err_with(|| format!("failed to register peer {}", pid))?;
        }

        for node in &self.nodes {
            node.start().await?;
        }

        Ok(())
    }

    pub fn node(&self, pid: Pid) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.identity().pid == pid)
    }

    /// Waits for `count` completed snapshots, sorted by pid.
    pub async fn collect(&mut self, count: usize, limit: Duration) -> Result<Vec<LocalSnapshot>, Elapsed> {
        let snapshots = &mut self.snapshots;
        timeout(limit, async move {
            let mut collected = Vec::with_capacity(count);
            while collected.len() < count {
                match snapshots.recv().await {
                    Some(snapshot) => collected.push(snapshot),
                    None => break,
                }
            }
            collected.sort_by_key(|snapshot| (snapshot.sequence, snapshot.pid));
            collected
        })
        .await
    }

    /// Stops every running node and closes the listeners.
    pub async fn shutdown(self) {
        for node in self.nodes.iter().filter(|node| node.is_running()) {
            if let Err(err) = node.shutdown().await {
                warn!(pid = node.identity().pid, %err, "Failed to stop node");
            }
        }
        for listener in self.listeners {
            listener.abort();
        }
    }
}

/// Peer 0 sends a first message, the initiator records a snapshot, and peer 1
/// follows up with a second message, while every peer sends `messages`
/// randomly delayed messages in the background. Returns one snapshot per
/// peer.
pub async fn run(mesh: &mut Mesh, config: &WorkloadConfig) -> EyreResult<Vec<LocalSnapshot>> {
    config.validate()?;

    if let Some(first) = mesh.node(0) {
        report_send(first, first.send_application_message("First message from peer 0").await);
    }

    let mut background = spawn_background(mesh, config.messages);

    let initiator = mesh
        .node(config.initiator)
        .ok_or_else(|| eyre!("no peer with pid {}", config.initiator))?;
    initiator.initiate_snapshot()?;
    info!(pid = config.initiator, "Requested snapshot");

    sleep(config.delay).await;

    if let Some(second) = mesh.node(1) {
        report_send(second, second.send_application_message("Second message from peer 1").await);
    }

    while let Some(joined) = background.join_next().await {
        if let Err(err) = joined {
            warn!(%err, "Background sender failed");
        }
    }

    let expected = mesh.nodes.len();
    let snapshots = mesh
        .collect(expected, config.timeout)
        .await
        .wrap_err("timed out waiting for every peer to finish its snapshot")?;

    if snapshots.len() < expected {
        bail!("only {} of {} peers reported a snapshot", snapshots.len(), expected);
    }

    Ok(snapshots)
}

fn spawn_background(mesh: &Mesh, messages: usize) -> JoinSet<()> {
    let mut tasks = JoinSet::new();

    for node in &mesh.nodes {
        let jitters: Vec<u64> = {
            let mut rng = rand::thread_rng();
            (0..messages).map(|_| rng.gen_range(0..=MAX_JITTER_MS)).collect()
        };
        let node = node.clone();

        let _ = tasks.spawn(async move {
            let pid = node.identity().pid;
            for (index, jitter) in jitters.into_iter().enumerate() {
                sleep(Duration::from_millis(jitter)).await;
                report_send(&node, node.send_application_message(format!("Message {} from peer {}", index, pid)).await);
            }
        });
    }

    tasks
}

fn report_send(node: &Node, result: Result<u64, NodeError>) {
    match result {
        Ok(clock) => info!(pid = node.identity().pid, clock, "Sent application message"),
        Err(err) => warn!(pid = node.identity().pid, %err, "Application message not fully delivered"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::RegistryServer;

    fn config(peers: u64, initiator: Pid, messages: usize) -> WorkloadConfig {
        WorkloadConfig {
            peers,
            initiator,
            messages,
            delay: Duration::from_millis(20),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_validate() {
        assert!(config(3, 2, 0).validate().is_ok());
        assert!(config(3, 3, 0).validate().is_err());
        assert!(config(0, 0, 0).validate().is_err());
    }

    #[tokio::test]
    async fn test_local_workload() {
        let mut mesh = Mesh::local(3).await.unwrap();

        let snapshots = run(&mut mesh, &config(3, 2, 5)).await.unwrap();

        assert_eq!(snapshots.len(), 3);
        for (pid, snapshot) in snapshots.iter().enumerate() {
            assert_eq!(snapshot.pid, pid as u64);
            assert_eq!(snapshot.sequence, 1);
            assert_eq!(snapshot.channels.len(), 2);
        }
        mesh.shutdown().await;
    }

    const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    /// A free base port; the next few are very likely free as well.
    async fn free_port() -> u16 {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_tcp_workload() {
        let registry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry_addr = registry.local_addr().unwrap();
        drop(tokio::spawn(RegistryServer::new().serve(registry)));

        let start_port = free_port().await;

        let mut mesh = Mesh::tcp(registry_addr, LOOPBACK, start_port, 3, Duration::from_secs(5))
            .await
            .unwrap();

        let snapshots = run(&mut mesh, &config(3, 2, 3)).await.unwrap();

        assert_eq!(snapshots.len(), 3);
        assert!(snapshots.iter().all(|snapshot| snapshot.sequence == 1));
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_tcp_setup_releases_listeners() {
        // Nothing listens here, so registering peer 0 fails after its
        // listener is already up.
        let registry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry_addr = registry.local_addr().unwrap();
        drop(registry);

        let start_port = free_port().await;
        let endpoint = SocketAddr::new(LOOPBACK, start_port);

        let result = Mesh::tcp(registry_addr, LOOPBACK, start_port, 2, Duration::from_secs(1)).await;
        assert!(result.is_err());

        let mut rebound = None;
        for _ in 0..50 {
            match TcpListener::bind(endpoint).await {
                Ok(listener) => {
                    rebound = Some(listener);
                    break;
                }
                Err(_) => sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(rebound.is_some(), "listener on {} was left running", endpoint);
    }
}
