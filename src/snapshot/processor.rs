use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::clock::ClockTracker;
use super::message::{Message, PeerName};
use super::recorder::{Recorder, Step};
use super::report::{ApplicationHook, SnapshotSink, SnapshotStatus};
use crate::common::NetworkError;
use crate::network::Outboxes;

pub type AckReceiver = oneshot::Receiver<Result<(), NetworkError>>;

pub enum Event {
    Deliver(Message),
    Initiate,
    Send {
        body: String,
        reply: oneshot::Sender<Dispatched>,
    },
    Status(oneshot::Sender<SnapshotStatus>),
    Shutdown,
}

/// A stamped application message and one acknowledgement per destination.
pub struct Dispatched {
    pub clock: u64,
    pub acks: Vec<(PeerName, AckReceiver)>,
}

/// Entry point for remote senders. Enqueues and returns; nothing runs on the
/// caller's task.
#[derive(Clone)]
pub struct Ingress {
    events: UnboundedSender<Event>,
}

impl Ingress {
    pub fn new(events: UnboundedSender<Event>) -> Self {
        Ingress { events }
    }

    pub fn deliver(&self, message: Message) -> Result<(), NetworkError> {
        self.events
            .send(Event::Deliver(message))
            .map_err(|_| NetworkError::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Owns the clock and the recorder. Everything that touches either goes
/// through `events`, one event at a time, in arrival order.
pub struct SnapshotProcessor {
    pub recorder: Recorder,
    pub clock: ClockTracker,
    pub events: UnboundedReceiver<Event>,
    pub outboxes: Outboxes,
    pub hook: Arc<dyn ApplicationHook>,
    pub sink: Arc<dyn SnapshotSink>,
}

impl SnapshotProcessor {
    pub fn new(
        recorder: Recorder,
        events: UnboundedReceiver<Event>,
        outboxes: Outboxes,
        hook: Arc<dyn ApplicationHook>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        let clock = ClockTracker::with_peers(recorder.peers().pids());
        SnapshotProcessor {
            recorder,
            clock,
            events,
            outboxes,
            hook,
            sink,
        }
    }

    pub async fn run(mut self) {
        let pid = self.recorder.peers().me.pid;
        info!(pid, peers = self.recorder.peers().len(), "Running snapshot processor");

        while let Some(event) = self.events.recv().await {
            match event {
                Event::Deliver(message) => self.handle_message(message),
                Event::Initiate => {
                    let step = self.recorder.initiate(&mut self.clock);
                    self.apply(step);
                }
                Event::Send { body, reply } => {
                    let dispatched = self.send_regular(body);
                    if reply.send(dispatched).is_err() {
                        debug!(pid, "Sender went away before dispatch completed");
                    }
                }
                Event::Status(reply) => {
                    let _ = reply.send(self.recorder.status(&self.clock));
                }
                Event::Shutdown => break,
            }
        }

        info!(pid, "Snapshot processor stopped");
    }

    fn handle_message(&mut self, message: Message) {
        debug!(pid = self.recorder.peers().me.pid, %message, id = %message.id, "Received message");

        match self.recorder.handle(&mut self.clock, message) {
            Ok(step) => self.apply(step),
            Err(err) => warn!(pid = self.recorder.peers().me.pid, %err, "Dropping message"),
        }
    }

    fn send_regular(&mut self, body: String) -> Dispatched {
        let me = &self.recorder.peers().me;
        let message = Message::regular(me.pid, me.name.clone(), self.clock.next_clock(), body);
        debug!(pid = me.pid, clock = message.clock, "Sending application message");

        Dispatched {
            clock: message.clock,
            acks: self.outboxes.broadcast_acked(&message),
        }
    }

    fn apply(&mut self, step: Step) {
        if let Some(marker) = step.broadcast {
            debug!(pid = self.recorder.peers().me.pid, clock = marker.clock, "Propagating marker");
            self.outboxes.broadcast(&marker);
        }

        if let Some(message) = step.deliver {
            self.hook.deliver(message);
        }

        if let Some(snapshot) = step.completed {
            info!(
                pid = snapshot.pid,
                sequence = snapshot.sequence,
                clock = snapshot.state.clock,
                in_flight = snapshot.in_flight(),
                "Snapshot episode complete"
            );
            self.sink.record(snapshot);
        }
    }
}
