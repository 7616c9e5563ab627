//! Contains common functions used across all the integration tests

use mailserver_bots::prelude::*;
use std::time::Duration;


/// Timeouts short enough to run many scenarios quickly against the simulated fleet
pub fn fast_config() -> RetrievalConfig {
    RetrievalConfig {
        peer_connect_timeout: Duration::from_millis(100),
        quiescence_window:    Duration::from_millis(300),
        request_timeout:      Duration::from_secs(1),
        ..RetrievalConfig::default()
    }
}

pub fn node_config() -> NodeConfig {
    NodeConfig::new(FLEET_BETA, MAIN_NETWORK_ID)
        .expect("the beta fleet should be known")
}

/// The enode of the `n`th simulated mailserver
pub fn mail_server(n: u8) -> String {
    format!("enode://{}@127.0.0.1:{}", hex::encode([n; 16]), 30504 + n as u16)
}

/// The time range every scenario stores envelopes in & requests
pub fn time_range() -> TimeRange {
    TimeRange { from: 1_600_000_000, to: 1_600_086_400 }
}

pub fn session(channels: &[&str]) -> SessionConfig {
    SessionConfig {
        time_range: time_range(),
        channels:   channels.iter().map(|channel| channel.to_string()).collect(),
    }
}

/// A fleet of `count` honest mailservers, each storing `per_channel` envelopes of every one of `channels`
pub fn seeded_test_fleet(count: u8, channels: &[&str], per_channel: usize) -> (SimulatedFleet, Vec<String>) {
    let mail_servers: Vec<String> = (0..count).map(mail_server).collect();
    let channels: Vec<String> = channels.iter().map(|channel| channel.to_string()).collect();
    let fleet = mailserver_bots::cli::seeded_fleet(&mail_servers, &channels, per_channel, time_range());
    (fleet, mail_servers)
}

pub fn started_router() -> SignalRouter {
    let router = SignalRouter::new();
    router.start().expect("starting the signals router");
    router
}

/// Automatically executed once
#[ctor::ctor]
fn suite_setup() {
    simple_logger::SimpleLogger::new().with_utc_timestamps().init().unwrap_or_else(|_| eprintln!("--> LOGGER WAS ALREADY STARTED"));
}
