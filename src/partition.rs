//! Partitioning of the model parameters among the actors.
//!
//! Every actor owns one disjoint partition of the parameters, determined only by the number of
//! actors, the actor index and the structure of the model:
//!
//! - [`PartitionScheme::LayerWise`]: actor `i` owns the layers `l` with `l % N == i`.
//! - [`PartitionScheme::Balanced`]: actor `i` owns the contiguous range of flat indices
//!   `[size * i / N, size * (i + 1) / N)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DType, Layer, ParameterContainer, ParameterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How parameters are split among the actors.
pub enum PartitionScheme {
    LayerWise,
    Balanced,
}

impl Default for PartitionScheme {
    fn default() -> Self {
        PartitionScheme::LayerWise
    }
}

#[derive(Debug, Error, PartialEq)]
/// Errors related to partitioning and reconstruction.
pub enum PartitionError {
    #[error("invalid actor index {index} for {count} actors")]
    ActorIndex { index: usize, count: usize },
    #[error("missing the partition of actor {0}")]
    Missing(usize),
    #[error("the partition of actor {actor} doesn't fit its assignment")]
    Mismatch { actor: usize },
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

/// An actor index with its owned indices and its partition.
type OwnedPartition<'a> = (usize, &'a [usize], &'a ParameterContainer);

#[derive(Debug, Clone, PartialEq)]
/// The assignment of parameter indices to actor indices.
pub struct PartitionAssignment {
    scheme: PartitionScheme,
    /// Actor index to the owned layer indices or flat indices.
    table: Vec<Vec<usize>>,
}

impl PartitionAssignment {
    /// Computes the assignment for a model with the structure of `template`.
    ///
    /// # Errors
    /// Fails if there are no actors.
    pub fn new(
        scheme: PartitionScheme,
        template: &ParameterContainer,
        actor_count: usize,
    ) -> Result<Self, PartitionError> {
        if actor_count == 0 {
            return Err(PartitionError::ActorIndex { index: 0, count: 0 });
        }
        let table = (0..actor_count)
            .map(|actor| match scheme {
                PartitionScheme::LayerWise => (0..template.len())
                    .filter(|layer| layer % actor_count == actor)
                    .collect(),
                PartitionScheme::Balanced => {
                    let size = template.size();
                    (size * actor / actor_count..size * (actor + 1) / actor_count).collect()
                }
            })
            .collect();
        Ok(Self { scheme, table })
    }

    pub fn scheme(&self) -> PartitionScheme {
        self.scheme
    }

    pub fn actor_count(&self) -> usize {
        self.table.len()
    }

    /// Gets the indices owned by an actor.
    ///
    /// # Errors
    /// Fails for an unknown actor index.
    pub fn indices(&self, actor: usize) -> Result<&[usize], PartitionError> {
        self.table
            .get(actor)
            .map(Vec::as_slice)
            .ok_or(PartitionError::ActorIndex {
                index: actor,
                count: self.table.len(),
            })
    }

    /// Extracts the partition owned by an actor.
    ///
    /// # Errors
    /// Fails for an unknown actor index or parameters that don't fit the assignment.
    pub fn partition(
        &self,
        params: &ParameterContainer,
        actor: usize,
    ) -> Result<ParameterContainer, PartitionError> {
        let indices = self.indices(actor)?;
        match self.scheme {
            PartitionScheme::LayerWise => Ok(params.take(indices)?),
            PartitionScheme::Balanced => {
                let flat = params.flatten();
                let values = indices
                    .iter()
                    .map(|index| flat.get(*index).copied())
                    .collect::<Option<Vec<_>>>()
                    .ok_or(PartitionError::Mismatch { actor })?;
                let layer = Layer::new(vec![values.len()], flat_dtype(params), values)?;
                Ok(vec![layer].into())
            }
        }
    }

    /// Reconstructs full parameters from the partitions of all actors.
    ///
    /// Actors that don't own any parameters may be missing from `partitions`.
    ///
    /// # Errors
    /// Fails if a partition is missing or doesn't fit the assignment.
    pub fn reconstruct(
        &self,
        template: &ParameterContainer,
        partitions: &BTreeMap<usize, ParameterContainer>,
    ) -> Result<ParameterContainer, PartitionError> {
        match self.scheme {
            PartitionScheme::LayerWise => self.reconstruct_layers(template, partitions),
            PartitionScheme::Balanced => self.reconstruct_flat(template, partitions),
        }
    }

    fn owned_partitions<'a>(
        &'a self,
        partitions: &'a BTreeMap<usize, ParameterContainer>,
    ) -> impl Iterator<Item = Result<OwnedPartition<'a>, PartitionError>> + 'a {
        self.table
            .iter()
            .enumerate()
            .filter(|(_, indices)| !indices.is_empty())
            .map(move |(actor, indices)| {
                partitions
                    .get(&actor)
                    .map(|partition| (actor, indices.as_slice(), partition))
                    .ok_or(PartitionError::Missing(actor))
            })
    }

    fn reconstruct_layers(
        &self,
        template: &ParameterContainer,
        partitions: &BTreeMap<usize, ParameterContainer>,
    ) -> Result<ParameterContainer, PartitionError> {
        let mut layers = vec![None; template.len()];
        for owned in self.owned_partitions(partitions) {
            let (actor, indices, partition) = owned?;
            if partition.len() != indices.len() {
                return Err(PartitionError::Mismatch { actor });
            }
            for (index, layer) in indices.iter().zip(partition.iter()) {
                let slot = layers
                    .get_mut(*index)
                    .ok_or(PartitionError::Mismatch { actor })?;
                *slot = Some(layer.clone());
            }
        }
        let layers = layers
            .into_iter()
            .zip(template.iter())
            .enumerate()
            .map(|(index, (layer, expected))| match layer {
                Some(layer) if layer.shape() == expected.shape() => Ok(layer),
                _ => Err(PartitionError::Mismatch {
                    actor: index % self.table.len(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(layers.into())
    }

    fn reconstruct_flat(
        &self,
        template: &ParameterContainer,
        partitions: &BTreeMap<usize, ParameterContainer>,
    ) -> Result<ParameterContainer, PartitionError> {
        let mut flat = vec![0.0; template.size()];
        for owned in self.owned_partitions(partitions) {
            let (actor, indices, partition) = owned?;
            let values = partition.flatten();
            if values.len() != indices.len() {
                return Err(PartitionError::Mismatch { actor });
            }
            for (index, value) in indices.iter().zip(values) {
                let slot = flat
                    .get_mut(*index)
                    .ok_or(PartitionError::Mismatch { actor })?;
                *slot = value;
            }
        }
        Ok(template.reshape(&flat)?)
    }
}

/// Gets the type of a flat partition, which is `f32` only if every layer is.
fn flat_dtype(params: &ParameterContainer) -> DType {
    if params.iter().all(|layer| layer.dtype() == DType::F32) {
        DType::F32
    } else {
        DType::F64
    }
}
