use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Directory, Link};
use crate::common::NetworkError;
use crate::snapshot::{Ingress, Message, PeerInfo, PeerName};

/// In-process name service. Each node is handed its own reference at
/// construction; there is no shared global instance.
#[derive(Default)]
pub struct LocalDirectory {
    entries: RwLock<BTreeMap<PeerName, (PeerInfo, Ingress)>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        LocalDirectory::default()
    }

    /// Publishes a peer under its name, replacing any previous binding.
    pub fn bind(&self, info: PeerInfo, ingress: Ingress) {
        let _ = self.entries.write().insert(info.name.clone(), (info, ingress));
    }

    pub fn unbind(&self, name: &PeerName) {
        let _ = self.entries.write().remove(name);
    }
}

#[async_trait]
impl Directory for LocalDirectory {
    async fn list(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        Ok(self.entries.read().values().map(|(info, _)| info.clone()).collect())
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<Box<dyn Link>, NetworkError> {
        let entries = self.entries.read();
        let (_, ingress) = entries
            .get(&peer.name)
            .ok_or_else(|| NetworkError::UnknownPeer(peer.name.clone()))?;

        Ok(Box::new(LocalLink {
            ingress: ingress.clone(),
        }))
    }
}

pub struct LocalLink {
    ingress: Ingress,
}

#[async_trait]
impl Link for LocalLink {
    async fn deliver(&mut self, message: &Message) -> Result<(), NetworkError> {
        self.ingress.deliver(message.clone())
    }
}
