//! The inbox of model updates received from neighbors.
//!
//! An [`UpdateMarket`] holds one FIFO queue per neighbor, created once and never resized.
//! Inbound RPC handlers [`put()`] updates into the queues while the round loop [`collect()`]s them
//! according to the configured [`SynchronizationStrategy`]. Waiting consumers are woken through a
//! [`watch`] channel that counts arrivals, there is no polling.
//!
//! [`put()`]: UpdateMarket::put
//! [`collect()`]: UpdateMarket::collect

mod strategy;

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use futures::future::join_all;
use thiserror::Error;
use tokio::{sync::watch, time::timeout};

pub use self::strategy::SynchronizationStrategy;
use crate::{common::identity::ActorAddress, model::ModelUpdate};

/// The updates handed out by a market, per neighbor.
pub type Collected = BTreeMap<ActorAddress, Vec<ModelUpdate>>;

#[derive(Debug, Error, PartialEq)]
/// Errors of an update market.
pub enum MarketError {
    #[error("{0} is not a neighbor")]
    UnknownSender(ActorAddress),
    #[error("the market has been shut down")]
    Closed,
}

#[derive(Debug)]
/// Per neighbor queues of received updates.
pub struct UpdateMarket {
    queues: Mutex<BTreeMap<ActorAddress, VecDeque<ModelUpdate>>>,
    arrivals: watch::Sender<u64>,
    strategy: SynchronizationStrategy,
    allow_empty: bool,
}

impl UpdateMarket {
    /// Creates a market with an empty queue for every neighbor.
    ///
    /// Unless `allow_empty` is set, updates without content are dropped when they are collected.
    pub fn new(
        neighbors: impl IntoIterator<Item = ActorAddress>,
        strategy: SynchronizationStrategy,
        allow_empty: bool,
    ) -> Self {
        let queues = neighbors
            .into_iter()
            .map(|address| (address, VecDeque::new()))
            .collect();
        let (arrivals, _) = watch::channel(0);
        Self {
            queues: Mutex::new(queues),
            arrivals,
            strategy,
            allow_empty,
        }
    }

    pub fn strategy(&self) -> SynchronizationStrategy {
        self.strategy
    }

    fn queues(&self) -> MutexGuard<BTreeMap<ActorAddress, VecDeque<ModelUpdate>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn neighbors(&self) -> Vec<ActorAddress> {
        self.queues().keys().cloned().collect()
    }

    fn pop(&self, address: &ActorAddress) -> Option<ModelUpdate> {
        self.queues()
            .get_mut(address)
            .and_then(VecDeque::pop_front)
    }

    fn drain(&self, address: &ActorAddress) -> Vec<ModelUpdate> {
        self.queues()
            .get_mut(address)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Appends an update to the queue of its sender without blocking.
    ///
    /// # Errors
    /// Fails if the sender is not a neighbor.
    pub fn put(&self, update: ModelUpdate) -> Result<(), MarketError> {
        {
            let mut queues = self.queues();
            let queue = queues
                .get_mut(&update.sender)
                .ok_or_else(|| MarketError::UnknownSender(update.sender.clone()))?;
            queue.push_back(update);
        }
        self.arrivals.send_modify(|count| *count += 1);
        Ok(())
    }

    /// Gets the number of queued updates of a neighbor.
    pub fn pending(&self, address: &ActorAddress) -> usize {
        self.queues().get(address).map(VecDeque::len).unwrap_or_default()
    }

    /// Gets the number of queued updates of all neighbors.
    pub fn len(&self) -> usize {
        self.queues().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands out updates according to the synchronization strategy.
    ///
    /// Neighbors without any (non-empty) update are not part of the result.
    ///
    /// # Errors
    /// Fails if the market has been shut down while waiting.
    pub async fn collect(&self) -> Result<Collected, MarketError> {
        let collected = match self.strategy {
            SynchronizationStrategy::OneFromEach => self.one_from_each().await?,
            SynchronizationStrategy::Available => self
                .neighbors()
                .into_iter()
                .map(|address| {
                    let updates = self.drain(&address);
                    (address, updates)
                })
                .collect(),
            SynchronizationStrategy::MinOneFromEach => {
                let mut collected = self.one_from_each().await?;
                for (address, updates) in collected.iter_mut() {
                    updates.extend(self.drain(address));
                }
                collected
            }
            SynchronizationStrategy::OneFromMinPercent { percentage } => {
                self.one_from_min_percent(percentage).await?
            }
            SynchronizationStrategy::MinK { k } => self.min_k(k).await?,
            SynchronizationStrategy::OneFromEachTimeout { timeout_ms } => {
                self.one_from_each_timeout(timeout_ms).await
            }
        };
        Ok(self.filter(collected))
    }

    fn filter(&self, collected: Collected) -> Collected {
        collected
            .into_iter()
            .filter_map(|(address, updates)| {
                let updates = updates
                    .into_iter()
                    .filter(|update| self.allow_empty || !update.is_empty())
                    .collect::<Vec<_>>();
                if updates.is_empty() {
                    None
                } else {
                    Some((address, updates))
                }
            })
            .collect()
    }

    /// Waits until the queue of a neighbor yields an update.
    async fn take_one(&self, address: &ActorAddress) -> Result<ModelUpdate, MarketError> {
        let mut arrivals = self.arrivals.subscribe();
        loop {
            arrivals.borrow_and_update();
            if let Some(update) = self.pop(address) {
                return Ok(update);
            }
            arrivals.changed().await.map_err(|_| MarketError::Closed)?;
        }
    }

    async fn one_from_each(&self) -> Result<Collected, MarketError> {
        let mut collected = Collected::new();
        for address in self.neighbors() {
            let update = self.take_one(&address).await?;
            collected.insert(address, vec![update]);
        }
        Ok(collected)
    }

    async fn one_from_each_timeout(&self, timeout_ms: u64) -> Collected {
        let limit = std::time::Duration::from_millis(timeout_ms);
        let neighbors = self.neighbors();
        let results = join_all(
            neighbors
                .iter()
                .map(|address| timeout(limit, self.take_one(address))),
        )
        .await;
        neighbors
            .into_iter()
            .zip(results)
            .filter_map(|(address, result)| match result {
                Ok(Ok(update)) => Some((address, vec![update])),
                _ => {
                    debug!("no update from {} within {}ms", address, timeout_ms);
                    None
                }
            })
            .collect()
    }

    async fn one_from_min_percent(&self, percentage: f64) -> Result<Collected, MarketError> {
        let neighbors = self.neighbors();
        let required = strategy::quorum(neighbors.len(), percentage);
        let mut arrivals = self.arrivals.subscribe();
        let mut collected = Collected::new();
        loop {
            arrivals.borrow_and_update();
            for address in neighbors.iter() {
                if collected.contains_key(address) {
                    continue;
                }
                if let Some(update) = self.pop(address) {
                    collected.insert(address.clone(), vec![update]);
                }
            }
            if collected.len() >= required {
                return Ok(collected);
            }
            arrivals.changed().await.map_err(|_| MarketError::Closed)?;
        }
    }

    async fn min_k(&self, k: usize) -> Result<Collected, MarketError> {
        let neighbors = self.neighbors();
        let mut arrivals = self.arrivals.subscribe();
        let mut collected = Collected::new();
        let mut count = 0;
        loop {
            arrivals.borrow_and_update();
            // round robin over the neighbors until k updates are taken or the queues are empty
            let mut progress = true;
            while progress && count < k {
                progress = false;
                for address in neighbors.iter() {
                    if count == k {
                        break;
                    }
                    if let Some(update) = self.pop(address) {
                        collected.entry(address.clone()).or_default().push(update);
                        count += 1;
                        progress = true;
                    }
                }
            }
            if count >= k {
                return Ok(collected);
            }
            arrivals.changed().await.map_err(|_| MarketError::Closed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::model::{ParameterContainer, UpdatePayload};

    fn address(i: usize) -> ActorAddress {
        format!("actor:{}", i).into()
    }

    fn market(strategy: SynchronizationStrategy, allow_empty: bool) -> Arc<UpdateMarket> {
        Arc::new(UpdateMarket::new(
            (0..3).map(address),
            strategy,
            allow_empty,
        ))
    }

    fn update(from: usize, value: f64) -> ModelUpdate {
        ModelUpdate::new(
            address(from),
            UpdatePayload::Weights(ParameterContainer::from_vecs(vec![vec![value]])),
            10,
        )
    }

    fn values(updates: &[ModelUpdate]) -> Vec<f64> {
        updates
            .iter()
            .map(|u| u.payload.weights().unwrap().flatten()[0])
            .collect()
    }

    #[tokio::test]
    async fn test_put_unknown_sender() {
        let market = market(SynchronizationStrategy::Available, false);
        assert_eq!(
            market.put(update(7, 1.0)),
            Err(MarketError::UnknownSender(address(7)))
        );
        assert!(market.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_from_each_waits_for_every_neighbor() {
        let market = market(SynchronizationStrategy::OneFromEach, false);
        market.put(update(0, 1.0)).unwrap();
        market.put(update(0, 2.0)).unwrap();
        market.put(update(1, 3.0)).unwrap();

        let mut collect = tokio::spawn({
            let market = market.clone();
            async move { market.collect().await }
        });
        assert!(timeout(Duration::from_secs(5), &mut collect).await.is_err());

        market.put(update(2, 4.0)).unwrap();
        let collected = collect.await.unwrap().unwrap();
        assert_eq!(collected.len(), 3);
        assert_eq!(values(&collected[&address(0)]), vec![1.0]);
        assert_eq!(values(&collected[&address(1)]), vec![3.0]);
        assert_eq!(values(&collected[&address(2)]), vec![4.0]);
        // surplus updates stay queued for the next round
        assert_eq!(market.pending(&address(0)), 1);
    }

    #[tokio::test]
    async fn test_available_drains_without_waiting() {
        let market = market(SynchronizationStrategy::Available, false);
        market.put(update(0, 1.0)).unwrap();
        market.put(update(0, 2.0)).unwrap();
        market.put(update(2, 3.0)).unwrap();

        let collected = market.collect().await.unwrap();
        assert_eq!(values(&collected[&address(0)]), vec![1.0, 2.0]);
        assert_eq!(values(&collected[&address(2)]), vec![3.0]);
        assert!(!collected.contains_key(&address(1)));
        assert!(market.is_empty());

        assert!(market.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_min_one_from_each_drains_the_rest() {
        let market = market(SynchronizationStrategy::MinOneFromEach, false);
        for (from, value) in [(0, 1.0), (1, 2.0), (1, 3.0), (2, 4.0), (2, 5.0), (2, 6.0)] {
            market.put(update(from, value)).unwrap();
        }
        let collected = market.collect().await.unwrap();
        assert_eq!(values(&collected[&address(0)]), vec![1.0]);
        assert_eq!(values(&collected[&address(1)]), vec![2.0, 3.0]);
        assert_eq!(values(&collected[&address(2)]), vec![4.0, 5.0, 6.0]);
        assert!(market.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_from_min_percent() {
        let market = market(
            SynchronizationStrategy::OneFromMinPercent { percentage: 0.5 },
            false,
        );
        market.put(update(1, 1.0)).unwrap();
        market.put(update(1, 2.0)).unwrap();

        let mut collect = tokio::spawn({
            let market = market.clone();
            async move { market.collect().await }
        });
        // two distinct neighbors are required, a second update of the same one is not enough
        assert!(timeout(Duration::from_secs(5), &mut collect).await.is_err());

        market.put(update(2, 3.0)).unwrap();
        let collected = collect.await.unwrap().unwrap();
        assert_eq!(collected.len(), 2);
        assert_eq!(values(&collected[&address(1)]), vec![1.0]);
        assert_eq!(values(&collected[&address(2)]), vec![3.0]);
        assert_eq!(market.pending(&address(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_k_counts_globally() {
        let market = market(SynchronizationStrategy::MinK { k: 3 }, false);
        market.put(update(0, 1.0)).unwrap();
        market.put(update(0, 2.0)).unwrap();

        let mut collect = tokio::spawn({
            let market = market.clone();
            async move { market.collect().await }
        });
        assert!(timeout(Duration::from_secs(5), &mut collect).await.is_err());

        market.put(update(0, 3.0)).unwrap();
        market.put(update(0, 4.0)).unwrap();
        let collected = collect.await.unwrap().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(values(&collected[&address(0)]), vec![1.0, 2.0, 3.0]);
        assert_eq!(market.pending(&address(0)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_from_each_timeout_omits_silent_neighbors() {
        let market = market(
            SynchronizationStrategy::OneFromEachTimeout { timeout_ms: 300 },
            false,
        );
        market.put(update(0, 1.0)).unwrap();

        let delayed = market.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            delayed.put(update(2, 2.0)).unwrap();
        });

        let started = tokio::time::Instant::now();
        let collected = market.collect().await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed <= Duration::from_millis(305));
        assert_eq!(collected.len(), 2);
        assert!(!collected.contains_key(&address(1)));
        assert_eq!(values(&collected[&address(2)]), vec![2.0]);
    }

    #[tokio::test]
    async fn test_empty_updates_are_dropped_unless_allowed() {
        let strict = market(SynchronizationStrategy::OneFromEach, false);
        let lenient = market(SynchronizationStrategy::OneFromEach, true);
        for market in [&strict, &lenient] {
            market.put(update(0, 1.0)).unwrap();
            market.put(ModelUpdate::empty(address(1))).unwrap();
            market.put(update(2, 2.0)).unwrap();
        }

        let collected = strict.collect().await.unwrap();
        assert_eq!(collected.len(), 2);
        assert!(!collected.contains_key(&address(1)));

        let collected = lenient.collect().await.unwrap();
        assert_eq!(collected.len(), 3);
        assert!(collected[&address(1)][0].is_empty());
    }
}
