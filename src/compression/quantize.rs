use rand::Rng;

use crate::{
    compression::{CompressionError, CompressionMetadata},
    model::{DType, Layer, ParameterContainer},
};

/// Quantizes all layers with a common offset and scale.
pub(super) fn quantize<R: Rng + ?Sized>(
    params: &ParameterContainer,
    precision: u8,
    rng: &mut R,
) -> Result<(ParameterContainer, CompressionMetadata), CompressionError> {
    let dtype =
        DType::unsigned_for_bits(precision).ok_or(CompressionError::InvalidPrecision(precision))?;

    let (min, max) = params
        .iter()
        .flat_map(|layer| layer.values().iter().copied())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
            (min.min(value), max.max(value))
        });
    if params.iter().any(|layer| layer.values().iter().any(|v| !v.is_finite())) {
        return Err(CompressionError::NonFinite);
    }
    let offset = if min.is_finite() { min } else { 0.0 };
    let levels = 2_f64.powi(i32::from(precision));
    let range = max - min;
    let scale = if range.is_finite() && range > 0.0 {
        levels / range
    } else {
        1.0
    };
    // the top of the range maps to `2^P`, which doesn't fit into `P` bits
    let ceiling = levels - 1.0;

    let layers = params
        .iter()
        .map(|layer| {
            let values = layer
                .values()
                .iter()
                .map(|value| {
                    let mapped = (value - offset) * scale;
                    let floor = mapped.floor();
                    let rounded = if rng.gen::<f64>() < mapped - floor {
                        floor + 1.0
                    } else {
                        floor
                    };
                    rounded.min(ceiling)
                })
                .collect();
            Layer::new(layer.shape().to_vec(), dtype, values)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let metadata = CompressionMetadata::Quantized {
        offset,
        scale,
        precision,
        source_dtypes: params.iter().map(Layer::dtype).collect(),
    };
    Ok((layers.into(), metadata))
}

/// Restores quantized layers to their source types.
pub(super) fn dequantize(
    params: ParameterContainer,
    offset: f64,
    scale: f64,
    source_dtypes: &[DType],
) -> Result<ParameterContainer, CompressionError> {
    if params.len() != source_dtypes.len() {
        return Err(CompressionError::LayerCount {
            expected: source_dtypes.len(),
            actual: params.len(),
        });
    }
    let layers = params
        .into_layers()
        .into_iter()
        .zip(source_dtypes.iter())
        .map(|(layer, dtype)| {
            let values = layer
                .values()
                .iter()
                .map(|q| dtype.cast(q / scale + offset))
                .collect();
            Layer::new(layer.shape().to_vec(), *dtype, values)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(layers.into())
}
