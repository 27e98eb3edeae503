//! Model updates exchanged between actors.

use std::convert::TryFrom;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    common::identity::ActorAddress,
    compression::{Compression, CompressionError, CompressionMetadata},
    model::{
        encoding::{EncodedParameters, EncodingError},
        params::ParameterContainer,
    },
};

/// The aggregation weight on the wire that marks a partition.
pub const PARTITION_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The weight of an update in an average.
pub enum AggregationWeight {
    /// The number of local samples used to produce the update.
    Samples(u64),
    /// The update is a partition of the weights, not a regular update.
    Partition,
}

impl AggregationWeight {
    pub fn is_partition(&self) -> bool {
        matches!(self, AggregationWeight::Partition)
    }

    /// Gets the number of samples, which is zero for a partition.
    pub fn samples(&self) -> u64 {
        match self {
            AggregationWeight::Samples(samples) => *samples,
            AggregationWeight::Partition => 0,
        }
    }
}

impl From<AggregationWeight> for i64 {
    fn from(weight: AggregationWeight) -> Self {
        match weight {
            AggregationWeight::Samples(samples) => i64::try_from(samples).unwrap_or(i64::MAX),
            AggregationWeight::Partition => PARTITION_SENTINEL,
        }
    }
}

impl TryFrom<i64> for AggregationWeight {
    type Error = i64;

    fn try_from(weight: i64) -> Result<Self, Self::Error> {
        match weight {
            PARTITION_SENTINEL => Ok(AggregationWeight::Partition),
            samples if samples >= 0 => Ok(AggregationWeight::Samples(samples as u64)),
            invalid => Err(invalid),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The content of an update.
pub enum UpdatePayload {
    /// Nothing to contribute, e.g. because the receiver wasn't selected this round.
    Empty,
    Weights(ParameterContainer),
    WeightDelta(ParameterContainer),
    Gradient(ParameterContainer),
    SparseGradient(ParameterContainer),
    WeightsAndGradient {
        weights: ParameterContainer,
        gradient: ParameterContainer,
    },
    PartitionedWeights(ParameterContainer),
}

impl UpdatePayload {
    /// Checks whether neither weights nor a gradient are present.
    pub fn is_empty(&self) -> bool {
        matches!(self, UpdatePayload::Empty)
    }

    /// Gets the weights, weight delta or weight partition, if any.
    pub fn weights(&self) -> Option<&ParameterContainer> {
        match self {
            UpdatePayload::Weights(weights)
            | UpdatePayload::WeightDelta(weights)
            | UpdatePayload::PartitionedWeights(weights)
            | UpdatePayload::WeightsAndGradient { weights, .. } => Some(weights),
            _ => None,
        }
    }

    /// Gets the dense or sparse gradient, if any.
    pub fn gradient(&self) -> Option<&ParameterContainer> {
        match self {
            UpdatePayload::Gradient(gradient)
            | UpdatePayload::SparseGradient(gradient)
            | UpdatePayload::WeightsAndGradient { gradient, .. } => Some(gradient),
            _ => None,
        }
    }

    fn kind(&self) -> UpdateKind {
        match self {
            UpdatePayload::Empty => UpdateKind::Empty,
            UpdatePayload::Weights(_) => UpdateKind::Weights,
            UpdatePayload::WeightDelta(_) => UpdateKind::WeightDelta,
            UpdatePayload::Gradient(_) => UpdateKind::Gradient,
            UpdatePayload::SparseGradient(_) => UpdateKind::SparseGradient,
            UpdatePayload::WeightsAndGradient { .. } => UpdateKind::WeightsAndGradient,
            UpdatePayload::PartitionedWeights(_) => UpdateKind::PartitionedWeights,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// An update received from or sent to a peer.
pub struct ModelUpdate {
    pub sender: ActorAddress,
    pub payload: UpdatePayload,
    pub weight: AggregationWeight,
}

impl ModelUpdate {
    /// Creates a regular update weighted by the number of local samples.
    pub fn new(sender: ActorAddress, payload: UpdatePayload, samples: u64) -> Self {
        Self {
            sender,
            payload,
            weight: AggregationWeight::Samples(samples),
        }
    }

    /// Creates an update without content.
    pub fn empty(sender: ActorAddress) -> Self {
        Self::new(sender, UpdatePayload::Empty, 0)
    }

    /// Creates a partition update.
    pub fn partition(sender: ActorAddress, partition: ParameterContainer) -> Self {
        Self {
            sender,
            payload: UpdatePayload::PartitionedWeights(partition),
            weight: AggregationWeight::Partition,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The tag of an [`UpdatePayload`] on the wire.
pub enum UpdateKind {
    Empty,
    Weights,
    WeightDelta,
    Gradient,
    SparseGradient,
    WeightsAndGradient,
    PartitionedWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A compressed and serialized parameter container.
pub struct WirePayload {
    pub parameters: EncodedParameters,
    pub compression: CompressionMetadata,
}

impl WirePayload {
    fn encode<R: Rng + ?Sized>(
        params: &ParameterContainer,
        compression: &Compression,
        rng: &mut R,
    ) -> Result<(Self, bool), CompressionError> {
        let (compressed, metadata) = compression.compress(params, rng)?;
        let payload = Self {
            parameters: EncodedParameters::from(&compressed),
            compression: metadata,
        };
        Ok((payload, compressed.is_sparse()))
    }

    fn decode(self) -> Result<ParameterContainer, DecodeError> {
        let params = ParameterContainer::try_from(self.parameters)?;
        Ok(self.compression.decompress(params)?)
    }
}

#[derive(Debug, thiserror::Error)]
enum DecodeError {
    #[error("{0:?} update without its parameters")]
    Missing(UpdateKind),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A [`ModelUpdate`] as it is sent to a peer.
pub struct UpdateMessage {
    pub sender: ActorAddress,
    pub kind: UpdateKind,
    pub aggregation_weight: i64,
    pub weights: Option<WirePayload>,
    pub gradient: Option<WirePayload>,
}

impl UpdateMessage {
    /// Compresses and serializes an update.
    ///
    /// A gradient that ends up sparse after compression is sent as a sparse gradient.
    ///
    /// # Errors
    /// Fails if the compression fails.
    pub fn encode<R: Rng + ?Sized>(
        update: &ModelUpdate,
        compression: &Compression,
        rng: &mut R,
    ) -> Result<Self, CompressionError> {
        let mut kind = update.payload.kind();
        let weights = update
            .payload
            .weights()
            .map(|weights| WirePayload::encode(weights, compression, &mut *rng))
            .transpose()?
            .map(|(payload, _)| payload);
        let gradient = match update.payload.gradient() {
            Some(gradient) => {
                let (payload, sparse) = WirePayload::encode(gradient, compression, rng)?;
                if sparse && kind == UpdateKind::Gradient {
                    kind = UpdateKind::SparseGradient;
                }
                Some(payload)
            }
            None => None,
        };
        Ok(Self {
            sender: update.sender.clone(),
            kind,
            aggregation_weight: update.weight.into(),
            weights,
            gradient,
        })
    }

    /// Gets the number of payload bytes.
    pub fn byte_len(&self) -> usize {
        [&self.weights, &self.gradient]
            .iter()
            .filter_map(|payload| payload.as_ref())
            .map(|payload| payload.parameters.byte_len())
            .sum()
    }

    /// Deserializes and decompresses the update.
    ///
    /// A malformed payload doesn't fail the decoding, it results in an update without content
    /// instead. The aggregation weight is kept in that case, so a malformed partition is still
    /// recognized as one.
    pub fn decode(self) -> ModelUpdate {
        let sender = self.sender.clone();
        let weight = match AggregationWeight::try_from(self.aggregation_weight) {
            Ok(weight) => weight,
            Err(invalid) => {
                warn!(
                    "discarding update from {} with invalid aggregation weight {}",
                    sender, invalid
                );
                return ModelUpdate::empty(sender);
            }
        };
        let payload = self.decode_payload().unwrap_or_else(|err| {
            warn!("discarding malformed update from {}: {}", sender, err);
            UpdatePayload::Empty
        });
        ModelUpdate {
            sender,
            payload,
            weight,
        }
    }

    fn decode_payload(self) -> Result<UpdatePayload, DecodeError> {
        let kind = self.kind;
        let weights = self.weights.map(WirePayload::decode).transpose()?;
        let gradient = self.gradient.map(WirePayload::decode).transpose()?;
        let missing = || DecodeError::Missing(kind);

        let payload = match kind {
            UpdateKind::Empty => UpdatePayload::Empty,
            UpdateKind::Weights => UpdatePayload::Weights(weights.ok_or_else(missing)?),
            UpdateKind::WeightDelta => UpdatePayload::WeightDelta(weights.ok_or_else(missing)?),
            UpdateKind::Gradient => UpdatePayload::Gradient(gradient.ok_or_else(missing)?),
            UpdateKind::SparseGradient => {
                UpdatePayload::SparseGradient(gradient.ok_or_else(missing)?)
            }
            UpdateKind::WeightsAndGradient => match (weights, gradient) {
                (Some(weights), Some(gradient)) => {
                    UpdatePayload::WeightsAndGradient { weights, gradient }
                }
                _ => return Err(missing()),
            },
            UpdateKind::PartitionedWeights => {
                UpdatePayload::PartitionedWeights(weights.ok_or_else(missing)?)
            }
        };
        Ok(payload)
    }
}
