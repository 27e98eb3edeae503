use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, From, Serialize, Deserialize,
)]
/// The address of an actor, e.g. `host:port`.
pub struct ActorAddress(String);

impl From<&str> for ActorAddress {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

impl AsRef<str> for ActorAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A neighbor of an actor.
pub struct Neighbor {
    pub address: ActorAddress,
    /// The ordinal index of the neighbor in `[0, N)`.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
/// Who an actor is and whom it talks to.
pub struct Identity {
    pub address: ActorAddress,
    /// The ordinal index of the actor in `[0, N)`.
    pub index: usize,
    /// The number of actors `N`.
    pub actor_count: usize,
    pub neighbors: Vec<Neighbor>,
}

impl Identity {
    /// Gets the addresses of all neighbors.
    pub fn neighbor_addresses(&self) -> Vec<ActorAddress> {
        self.neighbors.iter().map(|n| n.address.clone()).collect()
    }

    /// Gets the index of the neighbor with the given address.
    pub fn neighbor_index(&self, address: &ActorAddress) -> Option<usize> {
        self.neighbors
            .iter()
            .find(|n| &n.address == address)
            .map(|n| n.index)
    }

    /// Checks whether every other actor is a neighbor.
    pub fn is_fully_connected(&self) -> bool {
        self.neighbors.len() + 1 == self.actor_count
    }
}
