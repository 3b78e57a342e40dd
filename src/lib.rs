//! Termination safety for the members of a distributed database cluster.
//!
//! The operator places finalizers on the pods and volume claims of agents,
//! data-servers and coordinators. A finalizer is only released once the
//! matching guard confirms that losing the member cannot cost data or
//! agency quorum.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ controller: one reconcile = one inspection tick              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ inspector: pods, claims, members  →  DeploymentStatus        │
//! │ finalizers: finalizer name → guard → verdict + effects       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ health loop → ClusterHealthCache → stale member reclaimer    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ StatusStore | ResourceStore | ClusterControl                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod cluster_api;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod finalizers;
pub mod guards;
pub mod health_cache;
pub mod inspector;
pub mod interval;
pub mod member;
pub mod metrics;
pub mod reclaimer;
pub mod resources;
pub mod shutdown;
pub mod store;

pub use error::{OperatorError, Result};
