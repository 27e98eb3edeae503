//! Compression of outbound parameter containers.
//!
//! A [`Compression`] is selected by configuration and turns a container into a (possibly sparse or
//! quantized) container plus the [`CompressionMetadata`] needed by the receiver to invert the
//! transform. The metadata travels with the payload, so the receiver doesn't need to know the
//! sender's configuration.
//!
//! - [`Compression::Quantize`] maps the values onto `2^P` levels with probabilistic rounding. The
//!   receiver recovers the values up to an error of `1/scale`.
//! - [`Compression::TopK`] and [`Compression::TopPercentage`] keep only the elements of largest
//!   magnitude per layer. Decompression is the identity, the discarded values are lost.

mod quantize;
mod sparsify;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DType, ParameterContainer, ParameterError};

#[derive(Debug, Error, PartialEq)]
/// Errors related to compression and decompression.
pub enum CompressionError {
    #[error("unsupported quantization precision of {0} bits")]
    InvalidPrecision(u8),
    #[error("sparsification percentage {0} is not in [0, 1]")]
    InvalidPercentage(f64),
    #[error("cannot quantize non-finite values")]
    NonFinite,
    #[error("metadata describes {expected} layers, the payload has {actual}")]
    LayerCount { expected: usize, actual: usize },
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// The compression applied to outbound payloads.
pub enum Compression {
    /// The identity.
    None,
    /// Probabilistic quantization to `precision` bits.
    Quantize { precision: u8 },
    /// Keep the `k` elements of largest magnitude per layer.
    TopK { k: usize },
    /// Keep `ceil(size * percentage)` elements of largest magnitude per layer.
    TopPercentage { percentage: f64 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Everything needed to invert a compression.
pub enum CompressionMetadata {
    None,
    Quantized {
        offset: f64,
        scale: f64,
        precision: u8,
        source_dtypes: Vec<DType>,
    },
    Sparsified,
}

impl Compression {
    /// Checks the parameters of the compression.
    ///
    /// # Errors
    /// Fails for a precision outside of `1..=64` bits or a percentage outside of `[0, 1]`.
    pub fn check(&self) -> Result<(), CompressionError> {
        match *self {
            Compression::Quantize { precision } => DType::unsigned_for_bits(precision)
                .map(|_| ())
                .ok_or(CompressionError::InvalidPrecision(precision)),
            Compression::TopPercentage { percentage } if !(0.0..=1.0).contains(&percentage) => {
                Err(CompressionError::InvalidPercentage(percentage))
            }
            _ => Ok(()),
        }
    }

    /// Compresses a container.
    ///
    /// # Errors
    /// Fails if the compression parameters are invalid or the container holds non-finite values
    /// that are to be quantized.
    pub fn compress<R: Rng + ?Sized>(
        &self,
        params: &ParameterContainer,
        rng: &mut R,
    ) -> Result<(ParameterContainer, CompressionMetadata), CompressionError> {
        self.check()?;
        match *self {
            Compression::None => Ok((params.clone(), CompressionMetadata::None)),
            Compression::Quantize { precision } => quantize::quantize(params, precision, rng),
            Compression::TopK { k } => Ok((
                sparsify::top_k(params, |_| k)?,
                CompressionMetadata::Sparsified,
            )),
            Compression::TopPercentage { percentage } => Ok((
                sparsify::top_k(params, |size| sparsify::percentage_count(size, percentage))?,
                CompressionMetadata::Sparsified,
            )),
        }
    }

    /// Compresses and immediately decompresses a container.
    ///
    /// This subjects a local contribution to the same lossy transform as the contributions
    /// received from peers.
    ///
    /// # Errors
    /// Fails if the compression fails.
    pub fn compress_decompress<R: Rng + ?Sized>(
        &self,
        params: &ParameterContainer,
        rng: &mut R,
    ) -> Result<ParameterContainer, CompressionError> {
        let (compressed, metadata) = self.compress(params, rng)?;
        metadata.decompress(compressed)
    }

    /// Checks whether this compression is the identity.
    pub fn is_none(&self) -> bool {
        matches!(self, Compression::None)
    }
}

impl CompressionMetadata {
    /// Inverts the compression described by this metadata.
    ///
    /// # Errors
    /// Fails if the metadata doesn't fit the payload.
    pub fn decompress(
        &self,
        params: ParameterContainer,
    ) -> Result<ParameterContainer, CompressionError> {
        match self {
            CompressionMetadata::None | CompressionMetadata::Sparsified => Ok(params),
            CompressionMetadata::Quantized {
                offset,
                scale,
                source_dtypes,
                ..
            } => quantize::dequantize(params, *offset, *scale, source_dtypes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_check() {
        assert!(Compression::None.check().is_ok());
        assert!(Compression::Quantize { precision: 8 }.check().is_ok());
        assert_eq!(
            Compression::Quantize { precision: 0 }.check(),
            Err(CompressionError::InvalidPrecision(0))
        );
        assert_eq!(
            Compression::TopPercentage { percentage: 1.5 }.check(),
            Err(CompressionError::InvalidPercentage(1.5))
        );
    }

    #[test]
    fn test_none_is_identity() {
        let params = ParameterContainer::from_vecs(vec![vec![1.0, -2.0], vec![3.0]]);
        let mut rng = ChaCha20Rng::seed_from_u64(13);
        let (compressed, metadata) = Compression::None.compress(&params, &mut rng).unwrap();
        assert_eq!(metadata, CompressionMetadata::None);
        assert_eq!(metadata.decompress(compressed).unwrap(), params);
    }

    #[test]
    fn test_compress_decompress_sparsifies() {
        let params = ParameterContainer::from_vecs(vec![vec![1.0, -4.0, 3.0]]);
        let mut rng = ChaCha20Rng::seed_from_u64(13);
        let restored = Compression::TopK { k: 1 }
            .compress_decompress(&params, &mut rng)
            .unwrap();
        assert_eq!(restored.flatten(), vec![0.0, -4.0, 0.0]);
    }
}
