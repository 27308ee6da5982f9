//! fleetmond - a small-LAN fleet monitor.
//!
//! Sweeps configured CIDR ranges for live hosts, admits named hosts into an
//! embedded SQLite database and periodically probes them over SSH for OS
//! identity, load averages, pending updates and root-filesystem free space.

pub mod config;
pub mod db;
pub mod http;
pub mod metrics;
pub mod model;
pub mod ping;
pub mod probe;
pub mod scanner;
pub mod scheduler;
