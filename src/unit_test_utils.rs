//! Common code used across unit tests

use crate::config::{NodeConfig, RetrievalConfig, FLEET_BETA, MAIN_NETWORK_ID};
use std::{
    sync::atomic::{AtomicU16, Ordering::Relaxed},
    time::Duration,
};


/// Call this to always get a different base port for the nodes' listen addresses
/// -- this way, many tests can be run in parallel without any port collision
pub fn next_base_port() -> u16 {
    static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(44300);
    NEXT_BASE_PORT.fetch_add(16, Relaxed)
}

/// A [RetrievalConfig] with timeouts short enough for tests against the simulated fleet
pub fn fast_retrieval_config() -> RetrievalConfig {
    RetrievalConfig {
        peer_connect_timeout: Duration::from_millis(100),
        quiescence_window:    Duration::from_millis(200),
        request_timeout:      Duration::from_secs(1),
        ..RetrievalConfig::default()
    }
}

pub fn test_node_config() -> NodeConfig {
    NodeConfig::new(FLEET_BETA, MAIN_NETWORK_ID)
        .expect("the beta fleet should be known")
}

/// Automatically executed once
/// (provided this module is accessed?)
#[ctor::ctor]
fn suite_setup() {
    simple_logger::SimpleLogger::new().with_utc_timestamps().init().unwrap_or_else(|_| eprintln!("--> LOGGER WAS ALREADY STARTED"));
}
