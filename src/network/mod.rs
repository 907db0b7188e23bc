pub mod codec;
pub mod local;
pub mod node;
pub mod registry;
pub mod tcp;

pub use local::*;
pub use node::*;
pub use registry::*;
pub use tcp::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::common::NetworkError;
use crate::snapshot::{AckReceiver, Message, PeerInfo, PeerName, Peers};

/*
    Channels are reliable and FIFO per ordered pair of peers. The transport
    only has to answer each individual send; ordering comes from the outbox,
    which pushes every message for one destination through a single task and
    a single link, one at a time. Destinations do not wait on each other.
*/

/// A send-capable handle to one remote peer.
#[async_trait]
pub trait Link: Send + 'static {
    async fn deliver(&mut self, message: &Message) -> Result<(), NetworkError>;
}

/// Name service: enumerates the mesh and opens links to its members.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<PeerInfo>, NetworkError>;

    async fn connect(&self, peer: &PeerInfo) -> Result<Box<dyn Link>, NetworkError>;
}

type AckSender = oneshot::Sender<Result<(), NetworkError>>;

struct Envelope {
    message: Message,
    ack: Option<AckSender>,
}

pub struct Outbox {
    peer: PeerName,
    tx: UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn spawn(directory: Arc<dyn Directory>, peer: PeerInfo) -> Self {
        let (tx, rx) = unbounded_channel();
        let name = peer.name.clone();
        drop(tokio::spawn(run_outbox(directory, peer, rx)));
        Outbox { peer: name, tx }
    }

    /// Queues a message without waiting for it to be sent. Failures are
    /// reported through `ack` if one is given and logged otherwise.
    pub fn send(&self, message: Message, ack: Option<AckSender>) {
        if let Err(err) = self.tx.send(Envelope { message, ack }) {
            warn!(to = %self.peer, "Outbox is closed");
            if let Some(ack) = err.0.ack {
                let _ = ack.send(Err(NetworkError::Closed(self.peer.clone())));
            }
        }
    }
}

async fn run_outbox(directory: Arc<dyn Directory>, peer: PeerInfo, mut rx: UnboundedReceiver<Envelope>) {
    let mut link: Option<Box<dyn Link>> = None;

    while let Some(Envelope { message, ack }) = rx.recv().await {
        let result = deliver(directory.as_ref(), &peer, &mut link, &message).await;

        match (&result, &ack) {
            (Ok(()), _) => debug!(to = %peer.name, clock = message.clock, "Sent message"),
            (Err(err), None) => warn!(to = %peer.name, clock = message.clock, %err, "Send failed"),
            (Err(err), Some(_)) => debug!(to = %peer.name, clock = message.clock, %err, "Send failed"),
        }

        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
    }
}

/// Sends over the cached link, connecting first if needed. A failed link is
/// dropped so the next message reconnects; the failed message is not retried.
async fn deliver(
    directory: &dyn Directory,
    peer: &PeerInfo,
    link: &mut Option<Box<dyn Link>>,
    message: &Message,
) -> Result<(), NetworkError> {
    let mut active = match link.take() {
        Some(active) => active,
        None => directory.connect(peer).await?,
    };

    active.deliver(message).await?;
    *link = Some(active);
    Ok(())
}

/// One outbox per outgoing channel.
pub struct Outboxes {
    boxes: BTreeMap<PeerName, Outbox>,
}

impl Outboxes {
    pub fn spawn(directory: Arc<dyn Directory>, peers: &Peers) -> Self {
        let boxes = peers
            .outgoing()
            .map(|info| (info.name.clone(), Outbox::spawn(directory.clone(), info.clone())))
            .collect();
        Outboxes { boxes }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn broadcast(&self, message: &Message) {
        for outbox in self.boxes.values() {
            outbox.send(message.clone(), None);
        }
    }

    pub fn broadcast_acked(&self, message: &Message) -> Vec<(PeerName, AckReceiver)> {
        self.boxes
            .iter()
            .map(|(name, outbox)| {
                let (tx, rx) = oneshot::channel();
                outbox.send(message.clone(), Some(tx));
                (name.clone(), rx)
            })
            .collect()
    }
}
