use thiserror::Error;

use crate::snapshot::{PeerName, Pid};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("peer {0} rejected the message: {1}")]
    Rejected(PeerName, String),

    #[error("connection to {0} closed")]
    Closed(PeerName),

    #[error("receiving peer has shut down")]
    Shutdown,

    #[error("peer {0} is not registered")]
    UnknownPeer(PeerName),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("{0} is not bound in the directory")]
    NotListed(PeerName),

    #[error("{name} is listed with pid {listed}, expected {expected}")]
    ConflictingSelf { name: PeerName, listed: Pid, expected: Pid },

    #[error("pid {0} is listed more than once")]
    DuplicatePid(Pid),

    #[error("peer {0} is listed more than once")]
    DuplicateName(PeerName),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message from unknown sender {name} (pid {pid})")]
    UnknownSender { pid: Pid, name: PeerName },

    #[error("message claims to come from this peer ({0})")]
    SelfSent(PeerName),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node has not been started")]
    NotStarted,

    #[error("node is already running")]
    AlreadyStarted,

    #[error("discovery failed: {0}")]
    Discovery(#[from] NetworkError),

    #[error("invalid membership: {0}")]
    Membership(#[from] MembershipError),

    #[error("message with clock {clock} failed to reach {} peer(s)", .failures.len())]
    PartialDelivery {
        clock: u64,
        failures: Vec<(PeerName, NetworkError)>,
    },

    #[error("dispatch loop has stopped")]
    Stopped,
}
