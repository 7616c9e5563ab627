//! Contains the functional requirements (+ tests) for a single mailserver retrieval

use crate::utils::*;
use mailserver_bots::prelude::*;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;


/// Runs a single work unit against the first mailserver of `fleet`
async fn retrieve(fleet: SimulatedFleet, config: RetrievalConfig, session: &SessionConfig) -> Result<Retrieval, WorkError> {
    let router = started_router();
    let unit = RetrievalWorkUnit::new(Arc::new(fleet), mail_server(0), node_config(), config);
    let result = unit.execute(session, &router, &CancellationToken::new()).await;
    assert_eq!(router.correlator().registrations(), 0, "the unit must release its registration on every exit path");
    assert_eq!(router.correlator().reservations(), 0, "no reservation may outlive the unit");
    result
}


/// An honest mailserver delivers everything in the range, for every channel, and the unit confirms
/// the announced last envelope was received
#[cfg_attr(not(doc), tokio::test)]
async fn honest_mail_servers_are_confirmed() {
    let (fleet, _) = seeded_test_fleet(1, &["status", "dapps"], 7);
    let retrieval = retrieve(fleet, fast_config(), &session(&["status", "dapps"])).await
        .expect("the retrieval should have been confirmed");
    assert_eq!(retrieval.len(), 14);
    assert!(!retrieval.empty_range);
    let last_envelope = retrieval.last_envelope.expect("the last envelope should be known");
    assert!(retrieval.messages.iter().any(|message| message.hash == last_envelope));
}

/// The completion signal may arrive before the messages -- or even before the request RPC returns its id:
/// neither case may lose the signal nor the messages
#[cfg_attr(not(doc), tokio::test)]
async fn signals_are_never_lost() {
    for behavior in [MailServerBehavior::SignalFirst, MailServerBehavior::SignalBeforeReply] {
        let (fleet, mail_servers) = seeded_test_fleet(1, &["status"], 5);
        fleet.set_behavior(&mail_servers[0], behavior);
        let retrieval = retrieve(fleet, fast_config(), &session(&["status"])).await
            .unwrap_or_else(|err| panic!("{behavior:?}: the retrieval should have been confirmed: {err}"));
        assert_eq!(retrieval.len(), 5, "{behavior:?}");
    }
}

/// "The server answered but a message is missing" is an incomplete retrieval naming the missing envelope
#[cfg_attr(not(doc), tokio::test)]
async fn withheld_envelopes_are_detected() {
    let (fleet, mail_servers) = seeded_test_fleet(1, &["status"], 5);
    fleet.set_behavior(&mail_servers[0], MailServerBehavior::WithholdLast);
    let result = retrieve(fleet, fast_config(), &session(&["status"])).await;
    match result {
        Err(WorkError::Incomplete { expected: Some(_), received: 4 }) => (),
        other => panic!("expected an incomplete retrieval of 4 messages, got {other:?}"),
    }
}

/// "The server never answered" is also incomplete -- but with no expected envelope
#[cfg_attr(not(doc), tokio::test)]
async fn silent_mail_servers_are_incomplete() {
    let (fleet, mail_servers) = seeded_test_fleet(1, &["status"], 3);
    fleet.set_behavior(&mail_servers[0], MailServerBehavior::Silent);
    let result = retrieve(fleet, fast_config(), &session(&["status"])).await;
    assert!(matches!(result, Err(WorkError::Incomplete { expected: None, received: 3 })), "{result:?}");
}

/// Expiry is always a failure, distinguishable from the others
#[cfg_attr(not(doc), tokio::test)]
async fn expired_requests_fail() {
    let (fleet, mail_servers) = seeded_test_fleet(1, &["status"], 3);
    fleet.set_behavior(&mail_servers[0], MailServerBehavior::Expire);
    let result = retrieve(fleet, fast_config(), &session(&["status"])).await;
    assert!(matches!(result, Err(WorkError::Expired { .. })), "{result:?}");
}

/// A mailserver with nothing in the range is a success -- reported without waiting for the quiescence window
#[cfg_attr(not(doc), tokio::test)]
async fn empty_ranges_succeed_at_once() {
    let (fleet, _) = seeded_test_fleet(1, &["status"], 0);
    let config = RetrievalConfig { quiescence_window: Duration::from_secs(60), ..fast_config() };
    let retrieval = tokio::time::timeout(Duration::from_secs(10), retrieve(fleet, config, &session(&["status"]))).await
        .expect("the quiescence window should not have been waited for")
        .expect("an empty range is a success");
    assert!(retrieval.empty_range && retrieval.is_empty());
}

/// Envelopes outside the requested range (or of other channels) are not retrieved
#[cfg_attr(not(doc), tokio::test)]
async fn only_the_requested_range_is_retrieved() {
    let (fleet, mail_servers) = seeded_test_fleet(1, &["status"], 3);
    fleet.store(&mail_servers[0], "status", time_range().to + 1, b"too new");
    fleet.store(&mail_servers[0], "status", time_range().from - 1, b"too old");
    fleet.store(&mail_servers[0], "dapps", time_range().from + 1, b"another channel");
    let retrieval = retrieve(fleet, fast_config(), &session(&["status"])).await
        .expect("the retrieval should have been confirmed");
    assert_eq!(retrieval.len(), 3);
}

/// Setup failures are fatal to the unit & tell which step failed
#[cfg_attr(not(doc), tokio::test)]
async fn unreachable_mail_servers_fail_the_setup() {
    let (fleet, mail_servers) = seeded_test_fleet(1, &["status"], 3);
    fleet.set_unreachable(&mail_servers[0], true);
    let result = retrieve(fleet, fast_config(), &session(&["status"])).await;
    assert!(matches!(result, Err(WorkError::Setup { stage: SetupStage::WaitForPeer, source: NodeError::Timeout { .. } })), "{result:?}");
}

/// Cancelling interrupts the unit gracefully: the node is stopped & its data directory removed
#[cfg_attr(not(doc), tokio::test)]
async fn cancellation_tears_down() {
    let (fleet, mail_servers) = seeded_test_fleet(1, &["status"], 3);
    fleet.set_behavior(&mail_servers[0], MailServerBehavior::Silent);
    let data_dir_base = tempfile::tempdir().expect("creating the base data dir");
    let mut node_config = node_config();
    node_config.data_dir = data_dir_base.path().to_path_buf();
    let config = RetrievalConfig { quiescence_window: Duration::from_secs(60), ..fast_config() };

    let router = started_router();
    let unit = RetrievalWorkUnit::new(Arc::new(fleet), mail_servers[0].clone(), node_config, config);
    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });
    let result = tokio::time::timeout(Duration::from_secs(10), unit.execute(&session(&["status"]), &router, &cancellation)).await
        .expect("cancellation didn't interrupt the unit");
    assert!(matches!(result, Err(WorkError::Cancelled)), "{result:?}");
    let leftovers = std::fs::read_dir(data_dir_base.path()).expect("listing the base data dir").count();
    assert_eq!(leftovers, 0, "the unit's data directory should have been removed");
    assert_eq!(router.correlator().registrations(), 0);
}
