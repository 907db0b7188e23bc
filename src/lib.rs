/*
    Chandy-Lamport global snapshots over a full mesh of peers.

    Each peer runs one dispatch loop that owns its logical clock and its
    snapshot recorder. Remote peers only ever enqueue into that loop; outgoing
    messages leave through one FIFO outbox per destination. Any peer can start
    a snapshot, and every peer then reports its recorded state together with
    the messages that were in flight on each of its incoming channels.
*/

pub mod common;
pub mod config;
pub mod network;
pub mod snapshot;
pub mod workload;
