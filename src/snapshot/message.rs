use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{to_hex, FieldHasher, Hashable, Digest};

/*
    A message travels on exactly one channel, from the peer named by
    `source_name` to the peer that receives it. Every message, markers
    included, is stamped with the sender's clock at send time, so the clock
    is strictly increasing along any single channel.

    The name is the registry key of the sender and picks the incoming
    channel; the pid indexes the sender's clock. Both must agree with the
    membership listing for a message to be accepted.
*/

pub type Pid = u64;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerName(String);

impl PeerName {
    pub fn new(name: impl Into<String>) -> Self {
        PeerName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerName {
    fn from(name: &str) -> Self {
        PeerName::new(name)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Regular(String),
    Marker,
}

impl Payload {
    pub fn is_marker(&self) -> bool {
        matches!(self, Payload::Marker)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub source_pid: Pid,
    pub source_name: PeerName,
    pub clock: u64,
    pub payload: Payload,
}

impl Message {
    pub fn new(source_pid: Pid, source_name: PeerName, clock: u64, payload: Payload) -> Self {
        let mut message = Message {
            id: String::new(),
            source_pid,
            source_name,
            clock,
            payload,
        };
        message.id = to_hex(&message.hash());
        message
    }

    pub fn regular(source_pid: Pid, source_name: PeerName, clock: u64, body: impl Into<String>) -> Self {
        Message::new(source_pid, source_name, clock, Payload::Regular(body.into()))
    }

    pub fn marker(source_pid: Pid, source_name: PeerName, clock: u64) -> Self {
        Message::new(source_pid, source_name, clock, Payload::Marker)
    }

    pub fn is_marker(&self) -> bool {
        self.payload.is_marker()
    }
}

impl Hashable for Message {
    fn hash(&self) -> Digest {
        let (kind, body) = match &self.payload {
            Payload::Regular(body) => ("regular", body.as_str()),
            Payload::Marker => ("marker", ""),
        };
        FieldHasher::new()
            .field(self.source_pid.to_be_bytes())
            .field(self.source_name.as_str())
            .field(self.clock.to_be_bytes())
            .field(kind)
            .field(body)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Regular(body) => write!(f, "regular({}@{}: {:?})", self.source_name, self.clock, body),
            Payload::Marker => write!(f, "marker({}@{})", self.source_name, self.clock),
        }
    }
}
