use crate::model::{ParameterContainer, ParameterError};

/// Gets the number of elements kept from a layer of `size` elements.
pub(super) fn percentage_count(size: usize, percentage: f64) -> usize {
    (size as f64 * percentage).ceil() as usize
}

/// Keeps the `count(size)` elements of largest magnitude of each layer.
///
/// Ties are broken by position, the lower flat index wins.
pub(super) fn top_k(
    params: &ParameterContainer,
    count: impl Fn(usize) -> usize,
) -> Result<ParameterContainer, ParameterError> {
    let masks = params
        .iter()
        .map(|layer| {
            let values = layer.values();
            let keep = count(values.len()).min(values.len());
            let mut order = (0..values.len()).collect::<Vec<_>>();
            order.sort_by(|a, b| {
                values[*b]
                    .abs()
                    .total_cmp(&values[*a].abs())
                    .then_with(|| a.cmp(b))
            });
            let mut mask = vec![false; values.len()];
            for index in order.into_iter().take(keep) {
                mask[index] = true;
            }
            mask
        })
        .collect();
    params.sparsify(masks)
}
