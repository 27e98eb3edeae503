//! Layer-wise parameter containers.
//!
//! See the [model module] documentation since this is a private module anyways.
//!
//! [model module]: crate::model

use std::slice::Iter;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The element type of a layer on the wire.
///
/// Values are held as `f64` in memory but are always cast to what the data type is able to
/// represent, so serializing a layer never loses precision.
pub enum DType {
    F32,
    F64,
    U8,
    U16,
    U32,
    U64,
}

impl DType {
    /// Gets the number of bytes of a single serialized element.
    pub fn width(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::F32 | DType::U32 => 4,
            DType::F64 | DType::U64 => 8,
        }
    }

    /// Checks whether the type holds floating point data.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Gets the smallest unsigned integer type that holds `bits` bits.
    pub fn unsigned_for_bits(bits: u8) -> Option<DType> {
        match bits {
            1..=8 => Some(DType::U8),
            9..=16 => Some(DType::U16),
            17..=32 => Some(DType::U32),
            33..=64 => Some(DType::U64),
            _ => None,
        }
    }

    /// Casts a value to what this type is able to represent.
    pub fn cast(self, value: f64) -> f64 {
        match self {
            DType::F32 => value as f32 as f64,
            DType::F64 => value,
            DType::U8 => value as u8 as f64,
            DType::U16 => value as u16 as f64,
            DType::U32 => value as u32 as f64,
            DType::U64 => value as u64 as f64,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
/// Errors related to parameter container arithmetic and reshaping.
pub enum ParameterError {
    #[error("expected {expected} layers, got {actual}")]
    LayerCount { expected: usize, actual: usize },
    #[error("layer {layer} has shape {actual:?}, expected {expected:?}")]
    Shape {
        layer: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("expected {expected} elements, got {actual}")]
    ElementCount { expected: usize, actual: usize },
    #[error("layer index {index} out of range for {len} layers")]
    LayerIndex { index: usize, len: usize },
    #[error("mask of layer {layer} does not match its element count")]
    Mask { layer: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single tensor of a parameter container.
///
/// A layer is sparse when it carries a mask of active positions. Inactive positions always hold
/// zero.
pub struct Layer {
    shape: Vec<usize>,
    dtype: DType,
    values: Vec<f64>,
    mask: Option<Vec<bool>>,
}

impl Layer {
    /// Creates a dense layer.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the shape.
    pub fn new(shape: Vec<usize>, dtype: DType, values: Vec<f64>) -> Result<Self, ParameterError> {
        let expected = shape.iter().product::<usize>();
        if expected != values.len() {
            return Err(ParameterError::ElementCount {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            values: cast_all(dtype, values),
            mask: None,
        })
    }

    /// Creates a one-dimensional `f32` layer.
    pub fn from_values(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            dtype: DType::F32,
            values: cast_all(DType::F32, values),
            mask: None,
        }
    }

    /// Creates a layer of zeros.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            dtype,
            values: vec![0.0; len],
            mask: None,
        }
    }

    /// Turns the layer into a sparse layer, zeroing every inactive position.
    ///
    /// # Errors
    /// Fails if the mask length doesn't match the number of elements.
    pub fn with_mask(mut self, mask: Vec<bool>) -> Result<Self, ParameterError> {
        if mask.len() != self.values.len() {
            return Err(ParameterError::Mask { layer: 0 });
        }
        for (value, active) in self.values.iter_mut().zip(mask.iter()) {
            if !active {
                *value = 0.0;
            }
        }
        self.mask = Some(mask);
        Ok(self)
    }

    /// Replaces the values while keeping shape, type and mask.
    pub(crate) fn with_values(&self, values: Vec<f64>) -> Self {
        Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            values: cast_all(self.dtype, values),
            mask: self.mask.clone(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn mask(&self) -> Option<&[bool]> {
        self.mask.as_deref()
    }

    /// Gets the number of elements of this layer.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_sparse(&self) -> bool {
        self.mask.is_some()
    }

    /// Gets the number of active positions, which is the number of elements for a dense layer.
    pub fn active_count(&self) -> usize {
        self.mask
            .as_ref()
            .map(|mask| mask.iter().filter(|active| **active).count())
            .unwrap_or_else(|| self.values.len())
    }

    fn zip_with(
        &self,
        other: &Layer,
        index: usize,
        op: impl Fn(f64, f64) -> f64,
    ) -> Result<Layer, ParameterError> {
        if self.shape != other.shape {
            return Err(ParameterError::Shape {
                layer: index,
                expected: self.shape.clone(),
                actual: other.shape.clone(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| self.dtype.cast(op(*a, *b)))
            .collect();
        Ok(Layer {
            shape: self.shape.clone(),
            dtype: self.dtype,
            values,
            mask: None,
        })
    }
}

fn cast_all(dtype: DType, mut values: Vec<f64>) -> Vec<f64> {
    if dtype != DType::F64 {
        for value in values.iter_mut() {
            *value = dtype.cast(*value);
        }
    }
    values
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// An ordered sequence of layers, e.g. the weights or a gradient of a model.
///
/// All arithmetic returns a new container and results of arithmetic are always dense.
pub struct ParameterContainer {
    layers: Vec<Layer>,
}

impl From<Vec<Layer>> for ParameterContainer {
    fn from(layers: Vec<Layer>) -> Self {
        Self { layers }
    }
}

impl ParameterContainer {
    /// Creates a container of one-dimensional `f32` layers.
    pub fn from_vecs(layers: Vec<Vec<f64>>) -> Self {
        layers.into_iter().map(Layer::from_values).collect::<Vec<_>>().into()
    }

    /// Creates a container with the structure of `self` filled with zeros.
    pub fn zeros_like(&self) -> Self {
        self.layers
            .iter()
            .map(|layer| Layer::zeros(layer.shape.clone(), layer.dtype))
            .collect::<Vec<_>>()
            .into()
    }

    /// Gets the number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Gets the total number of elements over all layers.
    pub fn size(&self) -> usize {
        self.layers.iter().map(Layer::len).sum()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn iter(&self) -> Iter<Layer> {
        self.layers.iter()
    }

    pub fn into_layers(self) -> Vec<Layer> {
        self.layers
    }

    /// Checks whether any layer carries a mask.
    pub fn is_sparse(&self) -> bool {
        self.layers.iter().any(Layer::is_sparse)
    }

    /// Adds `other` elementwise.
    ///
    /// # Errors
    /// Fails if the containers don't have the same structure.
    pub fn add(&self, other: &ParameterContainer) -> Result<Self, ParameterError> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Subtracts `other` elementwise.
    ///
    /// # Errors
    /// Fails if the containers don't have the same structure.
    pub fn sub(&self, other: &ParameterContainer) -> Result<Self, ParameterError> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Multiplies with `other` elementwise.
    ///
    /// # Errors
    /// Fails if the containers don't have the same structure.
    pub fn mul(&self, other: &ParameterContainer) -> Result<Self, ParameterError> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Multiplies every element with a scalar.
    pub fn scale(&self, factor: f64) -> Self {
        self.map(|value| value * factor)
    }

    /// Applies `op` to every element.
    pub fn map(&self, op: impl Fn(f64) -> f64) -> Self {
        self.layers
            .iter()
            .map(|layer| layer.with_values(layer.values.iter().map(|v| op(*v)).collect()))
            .collect::<Vec<_>>()
            .into()
    }

    fn zip_with(
        &self,
        other: &ParameterContainer,
        op: impl Fn(f64, f64) -> f64 + Copy,
    ) -> Result<Self, ParameterError> {
        if self.len() != other.len() {
            return Err(ParameterError::LayerCount {
                expected: self.len(),
                actual: other.len(),
            });
        }
        self.layers
            .iter()
            .zip(other.layers.iter())
            .enumerate()
            .map(|(index, (a, b))| a.zip_with(b, index, op))
            .collect::<Result<Vec<_>, _>>()
            .map(Into::into)
    }

    /// Flattens all layers into one vector, in layer order.
    pub fn flatten(&self) -> Vec<f64> {
        self.layers
            .iter()
            .flat_map(|layer| layer.values.iter().copied())
            .collect()
    }

    /// Reshapes a flat vector into the structure of `self`.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the number of elements of `self`.
    pub fn reshape(&self, flat: &[f64]) -> Result<Self, ParameterError> {
        if flat.len() != self.size() {
            return Err(ParameterError::ElementCount {
                expected: self.size(),
                actual: flat.len(),
            });
        }
        let mut offset = 0;
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                let values = cast_all(layer.dtype, flat[offset..offset + layer.len()].to_vec());
                offset += layer.len();
                Layer {
                    shape: layer.shape.clone(),
                    dtype: layer.dtype,
                    values,
                    mask: None,
                }
            })
            .collect::<Vec<_>>();
        Ok(layers.into())
    }

    /// Selects the layers at `indices`, in the given order.
    ///
    /// # Errors
    /// Fails if an index is out of range.
    pub fn take(&self, indices: &[usize]) -> Result<Self, ParameterError> {
        indices
            .iter()
            .map(|index| {
                self.layers
                    .get(*index)
                    .cloned()
                    .ok_or(ParameterError::LayerIndex {
                        index: *index,
                        len: self.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Into::into)
    }

    /// Applies a mask to every layer, turning the container into a sparse one.
    ///
    /// # Errors
    /// Fails if the number of masks or a mask length doesn't match.
    pub fn sparsify(&self, masks: Vec<Vec<bool>>) -> Result<Self, ParameterError> {
        if masks.len() != self.len() {
            return Err(ParameterError::LayerCount {
                expected: self.len(),
                actual: masks.len(),
            });
        }
        self.layers
            .iter()
            .cloned()
            .zip(masks)
            .enumerate()
            .map(|(index, (layer, mask))| {
                layer
                    .with_mask(mask)
                    .map_err(|_| ParameterError::Mask { layer: index })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Into::into)
    }

    /// Drops all masks and keeps the values as they are.
    pub fn densify(&self) -> Self {
        self.layers
            .iter()
            .map(|layer| Layer {
                mask: None,
                ..layer.clone()
            })
            .collect::<Vec<_>>()
            .into()
    }

    /// Gets the largest absolute elementwise difference to `other`.
    ///
    /// # Errors
    /// Fails if the containers don't have the same structure.
    pub fn max_abs_diff(&self, other: &ParameterContainer) -> Result<f64, ParameterError> {
        Ok(self
            .sub(other)?
            .flatten()
            .into_iter()
            .fold(0.0, |max, value| f64::max(max, value.abs())))
    }
}
