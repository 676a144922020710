//! Cluster-wide aggregation of actuator records.
//!
//! Peers are resolved through an [`discovery::EndpointDirectory`], queried
//! concurrently through a [`fetch::Fetcher`], and their answers merged into a
//! single bounded sequence ordered by a schema-checked field expression.

pub mod actuator;
pub mod aggregate;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod export;
pub mod expr;
pub mod fetch;
pub mod record;

pub use actuator::{Capability, ClusterActuator, RecordQuery, SecurityContext, ServiceRef};
pub use aggregate::{AggregateError, Aggregation, AggregationWindow, PartialFailure};
