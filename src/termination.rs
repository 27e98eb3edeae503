//! The distributed termination protocol.
//!
//! Every actor keeps a permission per neighbor plus one for itself, all initially not granted. The
//! actor grants its own permission when its last round is done and notifies its neighbors, which
//! grant the sender's permission when the notification arrives. Once every permission is granted
//! the actor is [`TerminationState::AllReady`] and its service stops.
//!
//! Granting a permission and deriving the state happen under the same lock, so the final grant
//! always triggers the stop, no matter whether it comes from the round loop or from a neighbor.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use derive_more::Display;
use thiserror::Error;
use tokio::sync::watch;

use crate::common::identity::ActorAddress;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// The termination state of an actor.
pub enum TerminationState {
    /// The actor is still training.
    #[display(fmt = "running")]
    Running,
    /// The actor is done, some neighbors are not.
    #[display(fmt = "self ready")]
    SelfReady,
    /// The actor and all its neighbors are done.
    #[display(fmt = "all ready")]
    AllReady,
}

#[derive(Debug, Error, PartialEq)]
/// Errors of the termination protocol.
pub enum TerminationError {
    #[error("{0} is neither a neighbor nor the actor itself")]
    UnknownActor(ActorAddress),
}

#[derive(Debug)]
/// The termination permissions of an actor and its neighbors.
pub struct TerminationPermission {
    own: ActorAddress,
    permissions: Mutex<BTreeMap<ActorAddress, bool>>,
    state: watch::Sender<TerminationState>,
}

impl TerminationPermission {
    /// Creates permissions that are not granted for the actor and all of its neighbors.
    pub fn new(own: ActorAddress, neighbors: impl IntoIterator<Item = ActorAddress>) -> Self {
        let mut permissions = neighbors
            .into_iter()
            .map(|address| (address, false))
            .collect::<BTreeMap<_, _>>();
        permissions.insert(own.clone(), false);
        let (state, _) = watch::channel(TerminationState::Running);
        Self {
            own,
            permissions: Mutex::new(permissions),
            state,
        }
    }

    fn permissions(&self) -> MutexGuard<BTreeMap<ActorAddress, bool>> {
        self.permissions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grants the permission of the actor itself.
    pub fn mark_self_ready(&self) -> TerminationState {
        let mut permissions = self.permissions();
        permissions.insert(self.own.clone(), true);
        self.publish(&permissions)
    }

    /// Grants the permission of a neighbor.
    ///
    /// # Errors
    /// Fails if the address is unknown.
    pub fn grant(&self, address: &ActorAddress) -> Result<TerminationState, TerminationError> {
        let mut permissions = self.permissions();
        let permission = permissions
            .get_mut(address)
            .ok_or_else(|| TerminationError::UnknownActor(address.clone()))?;
        *permission = true;
        Ok(self.publish(&permissions))
    }

    /// Derives the state from the permissions and publishes it if it changed.
    ///
    /// Must be called while holding the lock of the permissions.
    fn publish(&self, permissions: &BTreeMap<ActorAddress, bool>) -> TerminationState {
        let state = if !permissions.get(&self.own).copied().unwrap_or_default() {
            TerminationState::Running
        } else if permissions.values().all(|granted| *granted) {
            TerminationState::AllReady
        } else {
            TerminationState::SelfReady
        };
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("termination state changed from {} to {}", current, state);
                *current = state;
                true
            }
        });
        state
    }

    /// Gets the current state.
    pub fn state(&self) -> TerminationState {
        *self.state.borrow()
    }

    /// Checks whether the permission of an actor has been granted.
    pub fn is_granted(&self, address: &ActorAddress) -> bool {
        self.permissions().get(address).copied().unwrap_or_default()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<TerminationState> {
        self.state.subscribe()
    }

    /// Waits until the actor and all of its neighbors are done.
    pub async fn all_ready(&self) {
        let mut state = self.subscribe();
        loop {
            if *state.borrow_and_update() == TerminationState::AllReady {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn address(i: usize) -> ActorAddress {
        format!("actor:{}", i).into()
    }

    fn permission() -> TerminationPermission {
        TerminationPermission::new(address(0), vec![address(1), address(2)])
    }

    #[test]
    fn test_self_then_neighbors() {
        let permission = permission();
        assert_eq!(permission.state(), TerminationState::Running);
        assert_eq!(permission.mark_self_ready(), TerminationState::SelfReady);
        assert_eq!(permission.grant(&address(1)), Ok(TerminationState::SelfReady));
        assert_eq!(permission.grant(&address(2)), Ok(TerminationState::AllReady));
        assert_eq!(permission.state(), TerminationState::AllReady);
    }

    #[test]
    fn test_neighbors_before_self() {
        let permission = permission();
        assert_eq!(permission.grant(&address(1)), Ok(TerminationState::Running));
        assert_eq!(permission.grant(&address(2)), Ok(TerminationState::Running));
        assert_eq!(permission.mark_self_ready(), TerminationState::AllReady);
    }

    #[test]
    fn test_grants_are_idempotent() {
        let permission = permission();
        permission.mark_self_ready();
        permission.grant(&address(1)).unwrap();
        permission.grant(&address(1)).unwrap();
        assert_eq!(permission.state(), TerminationState::SelfReady);
        assert!(permission.is_granted(&address(1)));
        assert!(!permission.is_granted(&address(2)));
    }

    #[test]
    fn test_unknown_actor() {
        let permission = permission();
        assert_eq!(
            permission.grant(&address(9)),
            Err(TerminationError::UnknownActor(address(9)))
        );
        assert_eq!(permission.state(), TerminationState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_ready_waits_for_the_last_grant() {
        let permission = Arc::new(permission());
        let mut waiting = tokio::spawn({
            let permission = permission.clone();
            async move { permission.all_ready().await }
        });

        permission.mark_self_ready();
        permission.grant(&address(2)).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), &mut waiting)
            .await
            .is_err());

        permission.grant(&address(1)).unwrap();
        waiting.await.unwrap();
        assert_eq!(permission.state(), TerminationState::AllReady);
    }

    #[tokio::test]
    async fn test_concurrent_grants_reach_all_ready_once() {
        let neighbors = (1..=16).map(address).collect::<Vec<_>>();
        let permission = Arc::new(TerminationPermission::new(address(0), neighbors.clone()));
        let mut states = permission.subscribe();

        let grants = neighbors
            .into_iter()
            .map(|neighbor| {
                let permission = permission.clone();
                tokio::spawn(async move { permission.grant(&neighbor).unwrap() })
            })
            .collect::<Vec<_>>();
        let own = permission.mark_self_ready();
        let mut all_ready = usize::from(own == TerminationState::AllReady);
        for grant in grants {
            if grant.await.unwrap() == TerminationState::AllReady {
                all_ready += 1;
            }
        }
        assert_eq!(all_ready, 1);
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), TerminationState::AllReady);
    }
}
