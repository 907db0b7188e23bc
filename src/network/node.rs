use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Directory, Outboxes};
use crate::common::NodeError;
use crate::snapshot::{
    ApplicationHook, Event, Ingress, PeerInfo, Peers, Recorder, SnapshotProcessor, SnapshotSink,
    SnapshotStatus,
};

/// One peer of the mesh: identity, ingress queue and, once started, the
/// dispatch loop and its outboxes.
pub struct Node {
    identity: PeerInfo,
    directory: Arc<dyn Directory>,
    hook: Arc<dyn ApplicationHook>,
    sink: Arc<dyn SnapshotSink>,
    events: UnboundedSender<Event>,
    pending: Mutex<Option<UnboundedReceiver<Event>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(
        identity: PeerInfo,
        directory: Arc<dyn Directory>,
        hook: Arc<dyn ApplicationHook>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        let (events, pending) = unbounded_channel();
        Node {
            identity,
            directory,
            hook,
            sink,
            events,
            pending: Mutex::new(Some(pending)),
            task: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &PeerInfo {
        &self.identity
    }

    /// Handle for the transport. Messages delivered before `start` wait in
    /// the queue.
    pub fn ingress(&self) -> Ingress {
        Ingress::new(self.events.clone())
    }

    /// Discovers the mesh and starts the dispatch loop. The listing is the
    /// membership for the rest of the run.
    pub async fn start(&self) -> Result<(), NodeError> {
        if self.pending.lock().is_none() {
            return Err(NodeError::AlreadyStarted);
        }

        let listing = self.directory.list().await?;
        let peers = Peers::from_listing(self.identity.clone(), listing)?;

        let events = self.pending.lock().take().ok_or(NodeError::AlreadyStarted)?;

        info!(
            pid = self.identity.pid,
            name = %self.identity.name,
            peers = ?peers.members.keys().collect::<Vec<_>>(),
            "Discovered peers"
        );

        let outboxes = Outboxes::spawn(self.directory.clone(), &peers);
        let processor = SnapshotProcessor::new(
            Recorder::new(peers),
            events,
            outboxes,
            self.hook.clone(),
            self.sink.clone(),
        );

        *self.task.lock() = Some(tokio::spawn(processor.run()));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stamps a regular message with the next clock value and sends it to
    /// every other peer. Returns the clock value, or the destinations that
    /// could not be reached.
    pub async fn send_application_message(&self, body: impl Into<String>) -> Result<u64, NodeError> {
        self.ensure_started()?;

        let (reply, dispatched) = oneshot::channel();
        self.submit(Event::Send {
            body: body.into(),
            reply,
        })?;
        let dispatched = dispatched.await.map_err(|_| NodeError::Stopped)?;

        let mut failures = Vec::new();
        for (peer, ack) in dispatched.acks {
            match ack.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push((peer, err)),
                Err(_) => warn!(pid = self.identity.pid, %peer, "Outbox dropped acknowledgement"),
            }
        }

        if failures.is_empty() {
            Ok(dispatched.clock)
        } else {
            Err(NodeError::PartialDelivery {
                clock: dispatched.clock,
                failures,
            })
        }
    }

    /// Asks the dispatch loop to record a snapshot. Ignored if one is already
    /// in progress.
    pub fn initiate_snapshot(&self) -> Result<(), NodeError> {
        self.ensure_started()?;
        self.submit(Event::Initiate)
    }

    pub async fn status(&self) -> Result<SnapshotStatus, NodeError> {
        self.ensure_started()?;

        let (reply, status) = oneshot::channel();
        self.submit(Event::Status(reply))?;
        status.await.map_err(|_| NodeError::Stopped)
    }

    /// Stops the dispatch loop after the events already queued ahead of it.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let task = self.task.lock().take().ok_or(NodeError::NotStarted)?;
        self.submit(Event::Shutdown)?;
        task.await.map_err(|_| NodeError::Stopped)
    }

    fn ensure_started(&self) -> Result<(), NodeError> {
        match self.task.lock().as_ref() {
            Some(_) => Ok(()),
            None => Err(NodeError::NotStarted),
        }
    }

    fn submit(&self, event: Event) -> Result<(), NodeError> {
        self.events.send(event).map_err(|_| NodeError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MembershipError;
    use crate::network::LocalDirectory;
    use crate::snapshot::{ChannelHook, ChannelSink, LogHook, LogSink, RecordingState};

    fn node(pid: u64, directory: &Arc<LocalDirectory>) -> Node {
        let info = PeerInfo::new(pid, pid.to_string().as_str(), format!("mem://{}", pid));
        let node = Node::new(info.clone(), directory.clone(), Arc::new(LogHook), Arc::new(LogSink));
        directory.bind(info, node.ingress());
        node
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let directory = Arc::new(LocalDirectory::new());
        let node = node(0, &directory);

        assert!(matches!(node.initiate_snapshot(), Err(NodeError::NotStarted)));
        assert!(matches!(node.send_application_message("x").await, Err(NodeError::NotStarted)));
        assert!(matches!(node.status().await, Err(NodeError::NotStarted)));

        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_start_requires_binding() {
        let directory = Arc::new(LocalDirectory::new());
        let info = PeerInfo::new(0, "0", "mem://0");
        let node = Node::new(info, directory.clone(), Arc::new(LogHook), Arc::new(LogSink));

        assert!(matches!(
            node.start().await,
            Err(NodeError::Membership(MembershipError::NotListed(_)))
        ));
    }

    #[tokio::test]
    async fn test_send_reaches_every_other_peer() {
        let directory = Arc::new(LocalDirectory::new());
        let sender = node(0, &directory);

        let (tx, mut rx) = unbounded_channel();
        let info = PeerInfo::new(1, "1", "mem://1");
        let receiver = Node::new(info.clone(), directory.clone(), Arc::new(ChannelHook::new(tx)), Arc::new(LogSink));
        directory.bind(info, receiver.ingress());

        sender.start().await.unwrap();
        receiver.start().await.unwrap();

        let clock = sender.send_application_message("hello").await.unwrap();
        let message = rx.recv().await.unwrap();

        assert_eq!(clock, 1);
        assert_eq!(message.clock, 1);
        assert_eq!(message.source_name.as_str(), "0");
    }

    #[tokio::test]
    async fn test_send_to_stopped_peer_is_reported() {
        let directory = Arc::new(LocalDirectory::new());
        let sender = node(0, &directory);
        let receiver = node(1, &directory);

        sender.start().await.unwrap();
        receiver.start().await.unwrap();
        receiver.shutdown().await.unwrap();
        drop(receiver);

        let result = sender.send_application_message("anyone?").await;

        match result {
            Err(NodeError::PartialDelivery { clock, failures }) => {
                assert_eq!(clock, 1);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0.as_str(), "1");
            }
            other => panic!("Unexpected result {:?}", other),
        }

        let status = sender.status().await.unwrap();
        assert_eq!(status.state, RecordingState::Idle);
        assert_eq!(status.clock, 1);
    }

    #[tokio::test]
    async fn test_messages_queued_before_start_are_processed() {
        let directory = Arc::new(LocalDirectory::new());
        let (tx, mut rx) = unbounded_channel();
        let info = PeerInfo::new(0, "0", "mem://0");
        let node = Node::new(info.clone(), directory.clone(), Arc::new(LogHook), Arc::new(ChannelSink::new(tx)));
        directory.bind(info, node.ingress());
        let _other = self::node(1, &directory);

        node.ingress()
            .deliver(crate::snapshot::Message::marker(1, "1".into(), 1))
            .unwrap();
        node.start().await.unwrap();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.state.last_known.get(&1), Some(&1));
    }

    #[tokio::test]
    async fn test_send_to_silent_tcp_peer_times_out() {
        use std::time::Duration;

        use tokio::net::TcpListener;

        use crate::common::NetworkError;
        use crate::network::{spawn_listener, RegistryServer, TcpDirectory};

        let registry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry_addr = registry.local_addr().unwrap();
        drop(tokio::spawn(RegistryServer::new().serve(registry)));

        // Peer 1 accepts connections and never answers.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = silent.accept().await.unwrap();
                held.push(stream);
            }
        });

        let own = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = PeerInfo::new(0, "0", own.local_addr().unwrap().to_string());
        let directory = Arc::new(TcpDirectory::new(registry_addr).with_timeout(Duration::from_millis(200)));
        directory.registry().bind(info.clone()).await.unwrap();
        directory
            .registry()
            .bind(PeerInfo::new(1, "1", silent_addr.to_string()))
            .await
            .unwrap();

        let node = Node::new(info, directory, Arc::new(LogHook), Arc::new(LogSink));
        let _listener = spawn_listener(own, node.ingress());
        node.start().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), node.send_application_message("hi"))
            .await
            .unwrap();

        match result {
            Err(NodeError::PartialDelivery { clock, failures }) => {
                assert_eq!(clock, 1);
                assert_eq!(failures.len(), 1);
                assert!(matches!(failures[0].1, NetworkError::Timeout(_)));
            }
            other => panic!("Unexpected result {:?}", other),
        }

        // The outbox dropped the stalled link and still serves later sends.
        let again = tokio::time::timeout(Duration::from_secs(5), node.send_application_message("again"))
            .await
            .unwrap();
        assert!(matches!(again, Err(NodeError::PartialDelivery { clock: 2, .. })));
    }
}
