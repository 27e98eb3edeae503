//! Neighbors from the adjacency matrix of the actors.

use thiserror::Error;

use crate::common::identity::{ActorAddress, Identity, Neighbor};

#[derive(Debug, Error, PartialEq)]
/// Errors of a misconfigured topology.
pub enum TopologyError {
    #[error("no actors")]
    Empty,
    #[error("the adjacency matrix must be {0}x{0}")]
    NotSquare(usize),
    #[error("the adjacency matrix is not symmetric at ({0}, {1})")]
    NotSymmetric(usize, usize),
    #[error("the address {0} appears more than once")]
    DuplicateAddress(ActorAddress),
    #[error("{0} is not an actor of the topology")]
    UnknownActor(ActorAddress),
    #[error("{0} is not connected to every other actor")]
    NotFullyConnected(ActorAddress),
}

#[derive(Debug, Clone, PartialEq)]
/// The actors and who is a neighbor of whom.
pub struct Topology {
    addresses: Vec<ActorAddress>,
    adjacency: Vec<Vec<bool>>,
}

impl Topology {
    /// Creates a topology from the addresses of the actors, ordered by index, and their adjacency
    /// matrix. The diagonal of the matrix is ignored.
    ///
    /// # Errors
    /// Fails if the matrix is not square, not symmetric or doesn't fit the addresses.
    pub fn new(addresses: Vec<ActorAddress>, adjacency: &[Vec<u8>]) -> Result<Self, TopologyError> {
        let n = addresses.len();
        if n == 0 {
            return Err(TopologyError::Empty);
        }
        if adjacency.len() != n || adjacency.iter().any(|row| row.len() != n) {
            return Err(TopologyError::NotSquare(n));
        }
        for (i, address) in addresses.iter().enumerate() {
            if addresses[..i].contains(address) {
                return Err(TopologyError::DuplicateAddress(address.clone()));
            }
        }
        let adjacency = adjacency
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .map(|(j, entry)| i != j && *entry != 0)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        for i in 0..n {
            for j in (i + 1)..n {
                if adjacency[i][j] != adjacency[j][i] {
                    return Err(TopologyError::NotSymmetric(i, j));
                }
            }
        }
        Ok(Self {
            addresses,
            adjacency,
        })
    }

    /// Creates a topology where every actor is a neighbor of every other actor.
    pub fn complete(addresses: Vec<ActorAddress>) -> Result<Self, TopologyError> {
        let n = addresses.len();
        let adjacency = vec![vec![1; n]; n];
        Self::new(addresses, &adjacency)
    }

    /// Gets the number of actors.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> &[ActorAddress] {
        &self.addresses
    }

    /// Gets the index of an actor.
    ///
    /// # Errors
    /// Fails if the address is not part of the topology.
    pub fn index_of(&self, address: &ActorAddress) -> Result<usize, TopologyError> {
        self.addresses
            .iter()
            .position(|a| a == address)
            .ok_or_else(|| TopologyError::UnknownActor(address.clone()))
    }

    /// Gets the identity of an actor, including its neighbors.
    ///
    /// # Errors
    /// Fails if the address is not part of the topology.
    pub fn identity(&self, address: &ActorAddress) -> Result<Identity, TopologyError> {
        let index = self.index_of(address)?;
        let neighbors = self.adjacency[index]
            .iter()
            .enumerate()
            .filter(|(_, adjacent)| **adjacent)
            .map(|(j, _)| Neighbor {
                address: self.addresses[j].clone(),
                index: j,
            })
            .collect();
        Ok(Identity {
            address: address.clone(),
            index,
            actor_count: self.len(),
            neighbors,
        })
    }

    /// Checks that the actor is a neighbor of every other actor.
    ///
    /// # Errors
    /// Fails if it isn't.
    pub fn require_full_connectivity(&self, address: &ActorAddress) -> Result<(), TopologyError> {
        if self.identity(address)?.is_fully_connected() {
            Ok(())
        } else {
            Err(TopologyError::NotFullyConnected(address.clone()))
        }
    }
}
