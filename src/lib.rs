//! A decentralized federated learning actor.
//!
//! A fixed set of actors trains a shared model without a central server. Every round each
//! [`actor::Actor`] trains locally, exchanges model updates with its neighbors over RPC, aggregates
//! what it receives and repeats. After the last round the actors shut down together through a
//! distributed termination protocol.
//!
//! The building blocks are independent of each other:
//!
//! - [`market`]: the per-neighbor inbox and its synchronization strategies
//! - [`aggregation`]: the aggregation algorithms
//! - [`compression`]: the codecs applied to outbound payloads
//! - [`participation`] and [`partition`]: who gets what
//! - [`termination`]: the shutdown handshake
//! - [`service`]: the RPC surface of an actor and the clients of its neighbors

#[macro_use]
extern crate tracing;

pub mod actor;
pub mod aggregation;
pub mod common;
pub mod compression;
pub mod market;
pub mod model;
pub mod participation;
pub mod partition;
pub mod service;
pub mod settings;
pub mod termination;
pub mod topology;

#[cfg(test)]
mod tests;
