//! fleetplane: reconciliation and cross-cluster synchronization for a
//! multi-cluster fleet
//!
//! The crate provides a level-triggered controller engine with an
//! optimistic-concurrency updater, and the controllers built on it: static
//! address allocation for Machines, replication of backup storage locations
//! from the master cluster into seeds, and the addon migration registry.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod store;
pub mod telemetry;
pub mod unstructured;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
