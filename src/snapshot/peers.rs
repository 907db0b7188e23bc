use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::message::{PeerName, Pid};
use crate::common::{MembershipError, ProtocolError};

/// One registry entry. `endpoint` is where the peer can be reached and need
/// not match its name.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub pid: Pid,
    pub name: PeerName,
    pub endpoint: String,
}

impl PeerInfo {
    pub fn new(pid: Pid, name: impl Into<PeerName>, endpoint: impl Into<String>) -> Self {
        PeerInfo {
            pid,
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Static membership of the mesh as seen from one peer. The mesh has no
/// self-edges, so `members` never contains this peer.
#[derive(Clone, Debug)]
pub struct Peers {
    pub me: PeerInfo,
    pub members: BTreeMap<PeerName, PeerInfo>,
}

impl Peers {
    /// Builds the set from a directory listing, which must include this
    /// peer; it is dropped from the members.
    pub fn from_listing(me: PeerInfo, listing: Vec<PeerInfo>) -> Result<Self, MembershipError> {
        let mut members = BTreeMap::new();
        let mut pids = BTreeSet::new();
        let _ = pids.insert(me.pid);
        let mut listed = false;

        for info in listing {
            if info.name == me.name {
                if info.pid != me.pid {
                    return Err(MembershipError::ConflictingSelf {
                        name: info.name,
                        listed: info.pid,
                        expected: me.pid,
                    });
                }
                listed = true;
                continue;
            }
            if !pids.insert(info.pid) {
                return Err(MembershipError::DuplicatePid(info.pid));
            }
            if let Some(previous) = members.insert(info.name.clone(), info) {
                return Err(MembershipError::DuplicateName(previous.name));
            }
        }

        if !listed {
            return Err(MembershipError::NotListed(me.name));
        }

        Ok(Peers { me, members })
    }

    pub fn is_member(&self, name: &PeerName) -> bool {
        self.members.contains_key(name)
    }

    /// Peers with a channel into this one.
    pub fn incoming(&self) -> BTreeSet<PeerName> {
        self.members.keys().cloned().collect()
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &PeerInfo> {
        self.members.values()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.members.values().map(|info| info.pid)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Checks that a received message names a known sender whose pid matches
    /// the listing.
    pub fn verify(&self, pid: Pid, name: &PeerName) -> Result<(), ProtocolError> {
        if *name == self.me.name || pid == self.me.pid {
            return Err(ProtocolError::SelfSent(name.clone()));
        }
        match self.members.get(name) {
            Some(info) if info.pid == pid => Ok(()),
            _ => Err(ProtocolError::UnknownSender {
                pid,
                name: name.clone(),
            }),
        }
    }
}
