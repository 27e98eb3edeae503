use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Decides when the updates of a round are enough and which ones are handed out.
pub enum SynchronizationStrategy {
    /// Wait for exactly one update from every neighbor.
    #[display(fmt = "one from each")]
    OneFromEach,
    /// Take whatever is queued without waiting.
    #[display(fmt = "available")]
    Available,
    /// Wait for one update from every neighbor, then take everything else that is queued.
    #[display(fmt = "min one from each")]
    MinOneFromEach,
    /// Wait for one update from at least `ceil(neighbors * percentage)` distinct neighbors.
    #[display(fmt = "one from a {} share", percentage)]
    OneFromMinPercent { percentage: f64 },
    /// Wait for `k` updates in total, from any neighbors.
    #[display(fmt = "min {}", k)]
    MinK { k: usize },
    /// Wait for one update from every neighbor, omitting neighbors that don't deliver in time.
    #[display(fmt = "one from each within {}ms", timeout_ms)]
    OneFromEachTimeout { timeout_ms: u64 },
}

impl Default for SynchronizationStrategy {
    fn default() -> Self {
        SynchronizationStrategy::OneFromEach
    }
}

impl SynchronizationStrategy {
    /// Gets the bound of the waiting time, if the strategy has one.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            SynchronizationStrategy::OneFromEachTimeout { timeout_ms } => {
                Some(Duration::from_millis(*timeout_ms))
            }
            _ => None,
        }
    }

    /// Checks whether the strategy waits for every neighbor without a bound.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            SynchronizationStrategy::OneFromEach | SynchronizationStrategy::MinOneFromEach
        )
    }
}

/// Gets the number of distinct neighbors required by a percentage quorum.
pub(crate) fn quorum(neighbors: usize, percentage: f64) -> usize {
    ((neighbors as f64 * percentage).ceil() as usize).min(neighbors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(4, 0.5), 2);
        assert_eq!(quorum(5, 0.5), 3);
        assert_eq!(quorum(3, 1.0), 3);
        assert_eq!(quorum(3, 0.0), 0);
        assert_eq!(quorum(3, 1.5), 3);
    }

    #[test]
    fn test_display() {
        assert_eq!(SynchronizationStrategy::MinK { k: 2 }.to_string(), "min 2");
        assert_eq!(
            SynchronizationStrategy::OneFromEachTimeout { timeout_ms: 300 }.to_string(),
            "one from each within 300ms"
        );
    }
}
