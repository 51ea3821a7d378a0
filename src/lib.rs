//! meshwatch - peer mesh reachability monitor.
//!
//! Every node discovers its peers, probes them over HTTP, TCP, UDP and ICMP,
//! and keeps a rolling check history with uptime counters for each of them.
//! It also answers the same probes for the rest of the fleet.

pub mod config;
pub mod db;
pub mod listener;
pub mod logging;
pub mod probe;
pub mod protocol;
pub mod scheduler;
