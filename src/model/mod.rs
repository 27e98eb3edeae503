//! Models, their parameters and the updates exchanged between actors.
//!
//! A [`ParameterContainer`] is an ordered sequence of [`Layer`]s. Containers are never mutated
//! across ownership boundaries, all arithmetic returns new containers. Containers are exchanged
//! wrapped in [`ModelUpdate`]s, which are compressed and serialized into [`UpdateMessage`]s.

pub(crate) mod encoding;
pub mod linear;
pub(crate) mod params;
pub mod trainer;
pub(crate) mod update;

pub use self::{
    encoding::{EncodedLayer, EncodedParameters, EncodingError},
    params::{DType, Layer, ParameterContainer, ParameterError},
    trainer::{LocalTrainer, Metrics, Proximal, TrainerError},
    update::{
        AggregationWeight,
        ModelUpdate,
        UpdateKind,
        UpdateMessage,
        UpdatePayload,
        WirePayload,
        PARTITION_SENTINEL,
    },
};
