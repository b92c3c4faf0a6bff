//! Multi-node scenarios for the Canopy mesh
//!
//! Every scenario runs a handful of [`MeshNode`](canopy_mesh::MeshNode)s
//! against one shared manual clock and a simulated radio that delivers
//! encoded frames between linked nodes:
//! - tree formation, loop rejection and healing after link loss
//! - bridge discovery, the single-candidate RSSI floor and bridge promotion
//! - heartbeat-based primary gateway election and failover
//! - `send_to_internet` end to end, with retries, duplicates and timeouts

pub mod test_utils;

#[cfg(test)]
mod routing_scenarios;

#[cfg(test)]
mod bridge_scenarios;

#[cfg(test)]
mod failover_scenarios;

#[cfg(test)]
mod relay_scenarios;
