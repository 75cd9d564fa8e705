//! Connector contract and dispatch
//!
//! - [`Backend`] - protocol-specific hooks a backend adapter implements
//! - [`ResilientConnector`] - wraps a backend with the policy stack of its type
//! - [`ConnectorRegistry`] - routes calls by connector type and owns shutdown
//! - [`testing`] - scriptable mock backends

pub mod backend;
pub mod connector;
pub mod registry;
pub mod testing;

pub use backend::Backend;
pub use connector::{
    ConnectorBuilder, ConnectorFuture, ConnectorStatus, ResilientConnector, DEFAULT_DRAIN_TIMEOUT,
};
pub use registry::{AnyConnector, ConnectorRegistry};
