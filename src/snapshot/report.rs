use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::message::{Message, PeerName, Pid};

/// The process state frozen when a peer starts recording.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RecordedState {
    pub clock: u64,
    pub last_known: BTreeMap<Pid, u64>,
}

/// One peer's share of a completed global snapshot: its recorded state plus
/// the messages that were in flight on each incoming channel.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LocalSnapshot {
    pub pid: Pid,
    pub name: PeerName,
    pub sequence: u64,
    pub state: RecordedState,
    pub channels: BTreeMap<PeerName, Vec<Message>>,
}

impl LocalSnapshot {
    pub fn in_flight(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    pub fn channel(&self, peer: &PeerName) -> &[Message] {
        self.channels.get(peer).map(Vec::as_slice).unwrap_or_default()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Recording,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub state: RecordingState,
    pub sequence: u64,
    pub clock: u64,
    pub awaiting: BTreeSet<PeerName>,
    pub buffered: usize,
}

/// Receives every completed snapshot episode, exactly once.
pub trait SnapshotSink: Send + Sync + 'static {
    fn record(&self, snapshot: LocalSnapshot);
}

/// Receives regular messages once the dispatch loop has processed them.
pub trait ApplicationHook: Send + Sync + 'static {
    fn deliver(&self, message: Message);
}

pub struct LogSink;

impl SnapshotSink for LogSink {
    fn record(&self, snapshot: LocalSnapshot) {
        match serde_json::to_string(&snapshot) {
            Ok(body) => info!(
                pid = snapshot.pid,
                sequence = snapshot.sequence,
                in_flight = snapshot.in_flight(),
                %body,
                "Snapshot complete"
            ),
            Err(err) => warn!(pid = snapshot.pid, %err, "Failed to encode snapshot"),
        }
    }
}

pub struct LogHook;

impl ApplicationHook for LogHook {
    fn deliver(&self, message: Message) {
        debug!(from = %message.source_name, clock = message.clock, %message, "Application message");
    }
}

/// Forwards snapshots into a channel; used by the demo runner and tests.
pub struct ChannelSink {
    tx: UnboundedSender<LocalSnapshot>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<LocalSnapshot>) -> Self {
        ChannelSink { tx }
    }
}

impl SnapshotSink for ChannelSink {
    fn record(&self, snapshot: LocalSnapshot) {
        if self.tx.send(snapshot).is_err() {
            warn!("Snapshot receiver dropped");
        }
    }
}

pub struct ChannelHook {
    tx: UnboundedSender<Message>,
}

impl ChannelHook {
    pub fn new(tx: UnboundedSender<Message>) -> Self {
        ChannelHook { tx }
    }
}

impl ApplicationHook for ChannelHook {
    fn deliver(&self, message: Message) {
        let _ = self.tx.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_counts_every_channel() {
        let mut channels = BTreeMap::new();
        let _ = channels.insert(PeerName::new("0"), vec![Message::regular(0, "0".into(), 1, "a")]);
        let _ = channels.insert(PeerName::new("2"), vec![]);
        let snapshot = LocalSnapshot {
            pid: 1,
            name: "1".into(),
            sequence: 1,
            state: RecordedState {
                clock: 3,
                last_known: BTreeMap::new(),
            },
            channels,
        };

        assert_eq!(snapshot.in_flight(), 1);
        assert_eq!(snapshot.channel(&"2".into()).len(), 0);
        assert_eq!(snapshot.channel(&"7".into()).len(), 0);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        let snapshot = LocalSnapshot {
            pid: 0,
            name: "0".into(),
            sequence: 4,
            state: RecordedState {
                clock: 0,
                last_known: BTreeMap::new(),
            },
            channels: BTreeMap::new(),
        };

        sink.record(snapshot.clone());

        assert_eq!(rx.recv().await.unwrap(), snapshot);
    }
}
