use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::clock::{ClockTracker, Observation};
use super::message::{Message, Payload, PeerName};
use super::peers::Peers;
use super::report::{LocalSnapshot, RecordedState, RecordingState, SnapshotStatus};
use crate::common::ProtocolError;

/*
    Marker-driven recording of a consistent cut.

    A peer records its own state the first time it either starts a snapshot
    or sees a marker, and only then sends its own marker out. From that point
    every incoming channel is open until the marker from that channel's
    sender arrives; regular messages received on an open channel are the
    channel's recorded state. With FIFO channels, a marker separates the
    messages a sender emitted before its cut from the ones after it.

    At most one episode is active. A second initiation or a repeated marker
    never resets the episode in progress.
*/

/// What the dispatch loop has to do after one step of the state machine.
/// `broadcast` goes to every other peer.
#[derive(Clone, Debug, Default)]
pub struct Step {
    pub deliver: Option<Message>,
    pub broadcast: Option<Message>,
    pub completed: Option<LocalSnapshot>,
}

#[derive(Debug)]
struct Episode {
    sequence: u64,
    recorded: RecordedState,
    awaiting: BTreeSet<PeerName>,
    channels: BTreeMap<PeerName, Vec<Message>>,
}

pub struct Recorder {
    peers: Peers,
    episode: Option<Episode>,
    completed: u64,
}

impl Recorder {
    pub fn new(peers: Peers) -> Self {
        Recorder {
            peers,
            episode: None,
            completed: 0,
        }
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn state(&self) -> RecordingState {
        match self.episode {
            Some(_) => RecordingState::Recording,
            None => RecordingState::Idle,
        }
    }

    pub fn status(&self, clock: &ClockTracker) -> SnapshotStatus {
        match &self.episode {
            Some(episode) => SnapshotStatus {
                state: RecordingState::Recording,
                sequence: episode.sequence,
                clock: clock.clock(),
                awaiting: episode.awaiting.clone(),
                buffered: episode.channels.values().map(Vec::len).sum(),
            },
            None => SnapshotStatus {
                state: RecordingState::Idle,
                sequence: self.completed,
                clock: clock.clock(),
                awaiting: BTreeSet::new(),
                buffered: 0,
            },
        }
    }

    /// Starts an episode on behalf of the local peer.
    pub fn initiate(&mut self, clock: &mut ClockTracker) -> Step {
        if let Some(episode) = &self.episode {
            info!(
                pid = self.peers.me.pid,
                sequence = episode.sequence,
                "Snapshot already in progress, ignoring initiation"
            );
            return Step::default();
        }

        info!(pid = self.peers.me.pid, "Initiating snapshot");
        self.begin(clock, None)
    }

    /// Feeds one received message through the state machine.
    pub fn handle(&mut self, clock: &mut ClockTracker, message: Message) -> Result<Step, ProtocolError> {
        self.peers.verify(message.source_pid, &message.source_name)?;

        if let Observation::Stale { known } = clock.observe(message.source_pid, message.clock) {
            warn!(
                pid = self.peers.me.pid,
                from = %message.source_name,
                clock = message.clock,
                known,
                "Clock did not advance on channel, possible FIFO violation"
            );
        }

        let step = match message.payload {
            Payload::Marker => self.on_marker(clock, &message.source_name),
            Payload::Regular(_) => self.on_regular(message),
        };

        Ok(step)
    }

    fn on_marker(&mut self, clock: &mut ClockTracker, from: &PeerName) -> Step {
        let Some(episode) = self.episode.as_mut() else {
            debug!(pid = self.peers.me.pid, %from, "First marker, recording local state");
            return self.begin(clock, Some(from));
        };

        if episode.awaiting.remove(from) {
            debug!(
                pid = self.peers.me.pid,
                %from,
                remaining = episode.awaiting.len(),
                "Channel closed by marker"
            );
        } else {
            warn!(pid = self.peers.me.pid, %from, "Marker on a channel that is already closed");
        }

        Step {
            completed: self.complete_if_done(),
            ..Step::default()
        }
    }

    fn on_regular(&mut self, message: Message) -> Step {
        if let Some(episode) = self.episode.as_mut() {
            if episode.awaiting.contains(&message.source_name) {
                debug!(
                    pid = self.peers.me.pid,
                    from = %message.source_name,
                    clock = message.clock,
                    "Recording in-flight message"
                );
                episode
                    .channels
                    .entry(message.source_name.clone())
                    .or_default()
                    .push(message.clone());
            }
        }

        Step {
            deliver: Some(message),
            ..Step::default()
        }
    }

    /// Records local state, opens every incoming channel except `from`, and
    /// builds the marker to propagate. The state is frozen before the marker
    /// takes its clock value. The marker also goes back to `from`: that peer
    /// is waiting for it to close the channel in the other direction.
    fn begin(&mut self, clock: &mut ClockTracker, from: Option<&PeerName>) -> Step {
        let recorded = RecordedState {
            clock: clock.clock(),
            last_known: clock.last_known_all().clone(),
        };

        let mut awaiting = self.peers.incoming();
        if let Some(from) = from {
            let _ = awaiting.remove(from);
        }

        let channels = self
            .peers
            .incoming()
            .into_iter()
            .map(|peer| (peer, Vec::new()))
            .collect();

        self.episode = Some(Episode {
            sequence: self.completed + 1,
            recorded,
            awaiting,
            channels,
        });

        let me = &self.peers.me;
        let marker = Message::marker(me.pid, me.name.clone(), clock.next_clock());

        Step {
            deliver: None,
            broadcast: Some(marker),
            completed: self.complete_if_done(),
        }
    }

    fn complete_if_done(&mut self) -> Option<LocalSnapshot> {
        if !self.episode.as_ref()?.awaiting.is_empty() {
            return None;
        }

        let episode = self.episode.take()?;
        self.completed = episode.sequence;

        let me = &self.peers.me;
        info!(pid = me.pid, sequence = episode.sequence, "Received all expected markers");

        Some(LocalSnapshot {
            pid: me.pid,
            name: me.name.clone(),
            sequence: episode.sequence,
            state: episode.recorded,
            channels: episode.channels,
        })
    }
}
