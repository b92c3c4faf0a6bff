//! Core functionality for the Canopy self-healing mesh.
//!
//! This crate provides the node identity type, the explicit millisecond
//! clock every mesh component is driven by, configuration records with
//! their validation rules, and logging initialisation.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;
pub mod types;

pub use config::{LogFormat, MeshConfig, NodeConfig, SharedGatewayConfig};
pub use error::ConfigError;
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{NodeId, NodeRole, Rssi, NO_NODE};
