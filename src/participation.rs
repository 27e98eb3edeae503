//! Selection of the neighbors addressed in a round.

use rand::{seq::index, Rng};
use serde::{Deserialize, Serialize};

use crate::common::identity::ActorAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
/// The partial participation policy.
pub enum Participation {
    /// Every neighbor is addressed every round.
    None,
    /// `k` neighbors are sampled uniformly without replacement every round.
    RandomK { k: usize },
}

impl Default for Participation {
    fn default() -> Self {
        Participation::None
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// The neighbors of a round, split by the participation policy.
pub struct Selection {
    /// The neighbors that receive the update.
    pub selected: Vec<ActorAddress>,
    /// The neighbors that receive an empty update.
    pub excluded: Vec<ActorAddress>,
}

impl Participation {
    /// Splits the neighbors into selected and excluded ones, keeping their order.
    pub fn select<R: Rng + ?Sized>(&self, neighbors: &[ActorAddress], rng: &mut R) -> Selection {
        match *self {
            Participation::None => Selection {
                selected: neighbors.to_vec(),
                excluded: Vec::new(),
            },
            Participation::RandomK { k } => {
                let amount = k.min(neighbors.len());
                let mut chosen = vec![false; neighbors.len()];
                for i in index::sample(rng, neighbors.len(), amount) {
                    chosen[i] = true;
                }
                let mut selection = Selection::default();
                for (address, chosen) in neighbors.iter().zip(chosen) {
                    if chosen {
                        selection.selected.push(address.clone());
                    } else {
                        selection.excluded.push(address.clone());
                    }
                }
                selection
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::round_rng;

    fn neighbors() -> Vec<ActorAddress> {
        (0..5).map(|i| format!("actor:{}", i).into()).collect()
    }

    #[test]
    fn test_none_selects_all() {
        let selection = Participation::None.select(&neighbors(), &mut round_rng(13, 0, 0));
        assert_eq!(selection.selected, neighbors());
        assert!(selection.excluded.is_empty());
    }

    #[test]
    fn test_random_k() {
        let policy = Participation::RandomK { k: 2 };
        let selection = policy.select(&neighbors(), &mut round_rng(13, 0, 0));
        assert_eq!(selection.selected.len(), 2);
        assert_eq!(selection.excluded.len(), 3);
        let mut all = selection.selected.clone();
        all.extend(selection.excluded.clone());
        all.sort();
        assert_eq!(all, neighbors());

        // deterministic per round seed
        let again = policy.select(&neighbors(), &mut round_rng(13, 0, 0));
        assert_eq!(again, selection);
    }

    #[test]
    fn test_random_k_larger_than_neighbors() {
        let selection =
            Participation::RandomK { k: 9 }.select(&neighbors(), &mut round_rng(13, 1, 0));
        assert_eq!(selection.selected, neighbors());
    }

    #[test]
    fn test_random_k_varies_over_rounds() {
        let policy = Participation::RandomK { k: 1 };
        let picks = (0..20)
            .map(|round| policy.select(&neighbors(), &mut round_rng(13, round, 0)).selected)
            .collect::<Vec<_>>();
        assert!(picks.iter().any(|pick| pick != &picks[0]));
    }
}
