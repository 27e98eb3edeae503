//! Byte encoding of parameter containers.
//!
//! Every layer is encoded into its own byte vector of little endian elements of the layer's
//! [`DType`]. The [`EncodedParameters`] wire type additionally carries shapes, types and masks, so
//! it can be decoded without a template.

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::params::{DType, Layer, ParameterContainer, ParameterError};

#[derive(Debug, Error, PartialEq)]
/// Errors related to the decoding of serialized parameters.
pub enum EncodingError {
    #[error("layer {layer} has {actual} bytes, expected {expected}")]
    ByteCount {
        layer: usize,
        expected: usize,
        actual: usize,
    },
    #[error("expected {expected} serialized layers, got {actual}")]
    LayerCount { expected: usize, actual: usize },
    #[error("no layers to decode")]
    Empty,
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

fn encode_values(values: &[f64], dtype: DType) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * dtype.width());
    for value in values {
        match dtype {
            DType::F32 => bytes.extend_from_slice(&(*value as f32).to_le_bytes()),
            DType::F64 => bytes.extend_from_slice(&value.to_le_bytes()),
            DType::U8 => bytes.push(*value as u8),
            DType::U16 => bytes.extend_from_slice(&(*value as u16).to_le_bytes()),
            DType::U32 => bytes.extend_from_slice(&(*value as u32).to_le_bytes()),
            DType::U64 => bytes.extend_from_slice(&(*value as u64).to_le_bytes()),
        }
    }
    bytes
}

fn decode_values(bytes: &[u8], dtype: DType) -> Vec<f64> {
    // the chunk size equals the type width, so the conversions into arrays cannot fail
    bytes
        .chunks_exact(dtype.width())
        .map(|chunk| match dtype {
            DType::F32 => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            DType::F64 => f64::from_le_bytes(array8(chunk)),
            DType::U8 => chunk[0] as f64,
            DType::U16 => u16::from_le_bytes([chunk[0], chunk[1]]) as f64,
            DType::U32 => u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            DType::U64 => u64::from_le_bytes(array8(chunk)) as f64,
        })
        .collect()
}

fn array8(chunk: &[u8]) -> [u8; 8] {
    let mut array = [0; 8];
    array.copy_from_slice(chunk);
    array
}

fn decode_layer(
    index: usize,
    shape: Vec<usize>,
    dtype: DType,
    bytes: &[u8],
) -> Result<Layer, EncodingError> {
    let expected = shape.iter().product::<usize>() * dtype.width();
    if bytes.len() != expected {
        return Err(EncodingError::ByteCount {
            layer: index,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(Layer::new(shape, dtype, decode_values(bytes, dtype))?)
}

impl ParameterContainer {
    /// Serializes the container into one byte vector per layer.
    ///
    /// Masks are not part of this representation, see [`EncodedParameters`] for that.
    pub fn serialize(&self) -> Vec<Vec<u8>> {
        self.iter()
            .map(|layer| encode_values(layer.values(), layer.dtype()))
            .collect()
    }

    /// Deserializes byte vectors produced by [`serialize()`] with shapes and types of `template`.
    ///
    /// # Errors
    /// Fails if the number of layers or the byte count of a layer doesn't match the template.
    ///
    /// [`serialize()`]: ParameterContainer::serialize
    pub fn deserialize(
        bytes: &[Vec<u8>],
        template: &ParameterContainer,
    ) -> Result<Self, EncodingError> {
        if bytes.len() != template.len() {
            return Err(EncodingError::LayerCount {
                expected: template.len(),
                actual: bytes.len(),
            });
        }
        template
            .iter()
            .zip(bytes.iter())
            .enumerate()
            .map(|(index, (layer, bytes))| {
                decode_layer(index, layer.shape().to_vec(), layer.dtype(), bytes)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A self describing serialized layer.
pub struct EncodedLayer {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub bytes: Vec<u8>,
    pub mask: Option<Vec<bool>>,
}

impl EncodedLayer {
    /// Gets the number of payload bytes, masks included.
    pub fn byte_len(&self) -> usize {
        self.bytes.len() + self.mask.as_ref().map(Vec::len).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// A self describing serialized parameter container, as it is sent to peers.
pub struct EncodedParameters {
    pub layers: Vec<EncodedLayer>,
}

impl EncodedParameters {
    /// Gets the number of payload bytes of all layers.
    pub fn byte_len(&self) -> usize {
        self.layers.iter().map(EncodedLayer::byte_len).sum()
    }
}

impl From<&ParameterContainer> for EncodedParameters {
    fn from(container: &ParameterContainer) -> Self {
        let layers = container
            .iter()
            .map(|layer| EncodedLayer {
                shape: layer.shape().to_vec(),
                dtype: layer.dtype(),
                bytes: encode_values(layer.values(), layer.dtype()),
                mask: layer.mask().map(<[bool]>::to_vec),
            })
            .collect();
        Self { layers }
    }
}

impl TryFrom<EncodedParameters> for ParameterContainer {
    type Error = EncodingError;

    fn try_from(encoded: EncodedParameters) -> Result<Self, Self::Error> {
        if encoded.layers.is_empty() {
            return Err(EncodingError::Empty);
        }
        encoded
            .layers
            .into_iter()
            .enumerate()
            .map(|(index, encoded)| -> Result<Layer, EncodingError> {
                let layer = decode_layer(index, encoded.shape, encoded.dtype, &encoded.bytes)?;
                match encoded.mask {
                    Some(mask) => Ok(layer
                        .with_mask(mask)
                        .map_err(|_| ParameterError::Mask { layer: index })?),
                    None => Ok(layer),
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Into::into)
    }
}
