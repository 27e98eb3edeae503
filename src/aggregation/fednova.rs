use crate::{
    aggregation::{weighted_average, AggregationError},
    model::ParameterContainer,
};

/// The contribution of an actor to FedNova.
#[derive(Debug, Clone, Copy)]
pub struct NovaContribution<'a> {
    pub gradient: &'a ParameterContainer,
    pub samples: u64,
    pub a_value: f64,
}

/// FedNova with a single gradient per actor.
///
/// Every gradient is normalized by the sign of its `a_value`, the normalized gradients are averaged
/// weighted by their sample counts and the average is applied as
/// `current - tau_eff * learning_rate * average`.
///
/// # Errors
/// Fails if an `a_value` is zero or the averaging fails.
pub fn fed_nova(
    current: &ParameterContainer,
    contributions: &[NovaContribution],
    tau_eff: f64,
    learning_rate: f64,
) -> Result<ParameterContainer, AggregationError> {
    let normalized = contributions
        .iter()
        .map(|contribution| {
            if contribution.a_value == 0.0 {
                return Err(AggregationError::ZeroNormalization);
            }
            let sign = contribution.a_value / contribution.a_value.abs();
            Ok((contribution.gradient.scale(sign), contribution.samples))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let weighted = normalized
        .iter()
        .map(|(gradient, samples)| (gradient, *samples))
        .collect::<Vec<_>>();
    let step = weighted_average(&weighted)?.scale(tau_eff * learning_rate);
    Ok(current.sub(&step)?)
}
