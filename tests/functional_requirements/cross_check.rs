//! Contains the functional requirements (+ tests) for cross-checking several mailservers

use crate::utils::*;
use mailserver_bots::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;


async fn cross_check(fleet: SimulatedFleet, mail_servers: &[String], channels: &[&str]) -> CrossCheckReport {
    CrossCheck::new(Arc::new(fleet), node_config(), fast_config())
        .run(mail_servers, session(channels), &CancellationToken::new()).await
        .expect("running the cross-check")
}


/// Consistent mailservers pass the cross-check
#[cfg_attr(not(doc), tokio::test)]
async fn consistent_fleets_pass() {
    let (fleet, mail_servers) = seeded_test_fleet(3, &["status"], 5);
    let report = cross_check(fleet, &mail_servers, &["status"]).await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.comparisons.len(), 2);
    assert!(report.outcomes.iter().all(|outcome| matches!(&outcome.result, Ok(retrieval) if retrieval.len() == 5)));
}

/// A mailserver lacking envelopes the others have is named as divergent -- even though its own retrieval is complete
#[cfg_attr(not(doc), tokio::test)]
async fn lagging_mail_servers_are_named() {
    let (fleet, mail_servers) = seeded_test_fleet(3, &["status"], 5);
    fleet.forget_newest(&mail_servers[1], 2);
    let report = cross_check(fleet, &mail_servers, &["status"]).await;
    assert_eq!(report.failed().count(), 0, "the lagging server still answers consistently with itself");
    assert_eq!(report.divergent(), vec![mail_servers[1].as_str()]);
    assert_eq!(report.exit_code(), 1);
}

/// A failing unit doesn't prevent its siblings from completing & being compared, but fails the run
#[cfg_attr(not(doc), tokio::test)]
async fn failing_units_do_not_block_the_others() {
    let (fleet, mail_servers) = seeded_test_fleet(3, &["status"], 5);
    fleet.set_unreachable(&mail_servers[0], true);
    fleet.set_behavior(&mail_servers[2], MailServerBehavior::SignalBeforeReply);
    let report = cross_check(fleet, &mail_servers, &["status"]).await;
    let failed: Vec<&str> = report.failed().map(|(mail_server, _)| mail_server).collect();
    assert_eq!(failed, vec![mail_servers[0].as_str()]);
    assert_eq!(report.comparisons.len(), 1, "the two remaining servers should have been compared");
    assert!(report.divergent().is_empty());
    assert_eq!(report.exit_code(), 1);
}

/// Every unit of a run gets its own listen address
#[cfg_attr(not(doc), test)]
fn units_listen_on_distinct_ports() {
    let (fleet, mail_servers) = seeded_test_fleet(4, &["status"], 1);
    let units = CrossCheck::new(Arc::new(fleet), node_config(), fast_config())
        .with_base_port(45000)
        .work_units(&mail_servers);
    let listen_addrs: Vec<&str> = units.iter().map(|unit| unit.node_config().listen_addr.as_str()).collect();
    assert_eq!(listen_addrs, vec!["127.0.0.1:45000", "127.0.0.1:45001", "127.0.0.1:45002", "127.0.0.1:45003"]);
    assert!(units.iter().all(|unit| unit.node_config().max_peers == 4));
}

/// Interrupting a cross-check reports every unit as cancelled, instead of hanging or exiting abruptly
#[cfg_attr(not(doc), tokio::test)]
async fn cancelled_runs_fail() {
    let (fleet, mail_servers) = seeded_test_fleet(2, &["status"], 5);
    let cancellation = CancellationToken::new();
    cancellation.cancel();
    let report = CrossCheck::new(Arc::new(fleet), node_config(), fast_config())
        .run(&mail_servers, session(&["status"]), &cancellation).await
        .expect("running the cross-check");
    assert!(report.outcomes.iter().all(|outcome| matches!(outcome.result, Err(WorkError::Cancelled))), "{report:?}");
    assert_eq!(report.exit_code(), 1);
}
