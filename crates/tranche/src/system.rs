//! Environment queries the engine consults but does not own.

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub kind: NetworkType,
    pub connected: bool,
}

pub trait SystemFacade: Send + Sync {
    /// The network traffic would currently go through, if any.
    fn active_network(&self) -> Option<NetworkInfo>;

    /// Decision made elsewhere (metered networks, roaming, battery) on whether
    /// downloading is currently permitted.
    fn is_network_allowed(&self) -> bool {
        true
    }

    fn check_connectivity(&self) -> bool {
        self.active_network().is_some_and(|network| network.connected) && self.is_network_allowed()
    }
}

/// A network state set by hand.
#[derive(Debug)]
pub struct FixedNetwork {
    network: RwLock<Option<NetworkInfo>>,
    allowed: RwLock<bool>,
}

impl FixedNetwork {
    pub fn connected(kind: NetworkType) -> Self {
        Self {
            network: RwLock::new(Some(NetworkInfo {
                kind,
                connected: true,
            })),
            allowed: RwLock::new(true),
        }
    }

    pub fn offline() -> Self {
        Self {
            network: RwLock::new(None),
            allowed: RwLock::new(true),
        }
    }

    pub fn set_network(&self, network: Option<NetworkInfo>) {
        *self.network.write() = network;
    }

    pub fn set_allowed(&self, allowed: bool) {
        *self.allowed.write() = allowed;
    }
}

impl Default for FixedNetwork {
    fn default() -> Self {
        Self::connected(NetworkType::Ethernet)
    }
}

impl SystemFacade for FixedNetwork {
    fn active_network(&self) -> Option<NetworkInfo> {
        *self.network.read()
    }

    fn is_network_allowed(&self) -> bool {
        *self.allowed.read()
    }
}
