//! Resting place for [CrossCheck], which asks the same question to several mailservers at once and compares their answers.
//!
//! One [RetrievalWorkUnit] is run, concurrently, per mailserver -- each with its own node, listen address & data directory,
//! all sharing a single [SignalRouter]. A failing unit doesn't affect its siblings: once all are done, the message counts
//! of the successful ones are sorted (descending) and compared pairwise, adjacent entries only. Every successful server
//! behind the best count is reported as divergent. See [CrossCheckReport].

use crate::{
    config::{NodeConfig, RetrievalConfig},
    error::{RouterError, WorkError},
    node::NodeLauncher,
    signals::SignalRouter,
    work::{Retrieval, RetrievalWorkUnit, SessionConfig},
};
use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
};
use futures::FutureExt;
use log::{error, info, warn};
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;


/// The first port nodes listen to -- the `i`th unit uses `base + i`
pub const DEFAULT_BASE_PORT: u16 = 44300;


/// Runs cross-checks of mailservers -- see the [module docs](self)
pub struct CrossCheck<Launcher: NodeLauncher> {
    launcher:    Arc<Launcher>,
    node_config: NodeConfig,
    config:      RetrievalConfig,
    base_port:   u16,
}

impl<Launcher: NodeLauncher> CrossCheck<Launcher> {

    pub fn new(launcher: Arc<Launcher>, node_config: NodeConfig, config: RetrievalConfig) -> Self {
        Self { launcher, node_config, config, base_port: DEFAULT_BASE_PORT }
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    /// One work unit per mailserver, each listening on its own port
    pub fn work_units(&self, mail_servers: &[String]) -> Vec<RetrievalWorkUnit<Launcher>> {
        mail_servers.iter()
            .enumerate()
            .map(|(i, mail_server)| {
                let mut node_config = self.node_config.clone();
                node_config.listen_addr = format!("127.0.0.1:{}", self.base_port as usize + i);
                node_config.max_peers = mail_servers.len();
                RetrievalWorkUnit::new(Arc::clone(&self.launcher), mail_server.clone(), node_config, self.config.clone())
            })
            .collect()
    }

    /// Runs a unit per entry of `mail_servers`, all retrieving `session`, waiting for all of them to finish.\
    /// `cancellation` is handed to every unit: cancelled units are reported as failed.
    pub async fn run(&self, mail_servers: &[String], session: SessionConfig, cancellation: &CancellationToken) -> Result<CrossCheckReport, RouterError> {
        let router = Arc::new(SignalRouter::new());
        let consume_loop = router.start()?;
        let session = Arc::new(session);
        let mut units = JoinSet::new();
        for (index, unit) in self.work_units(mail_servers).into_iter().enumerate() {
            let router = Arc::clone(&router);
            let session = Arc::clone(&session);
            let cancellation = cancellation.clone();
            units.spawn(async move {
                let result = AssertUnwindSafe(unit.execute(&session, &router, &cancellation))
                    .catch_unwind().await
                    .unwrap_or_else(|_| Err(WorkError::Aborted(String::from("the work unit panicked"))));
                (index, UnitOutcome { mail_server: unit.mail_server().to_string(), result })
            });
        }

        let mut outcomes: Vec<Option<UnitOutcome>> = mail_servers.iter().map(|_| None).collect();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(err) => error!("`mailserver-bots::CrossCheck`: a work unit task didn't finish: {err}"),
            }
        }
        router.shutdown();
        if let Err(err) = consume_loop.await {
            warn!("`mailserver-bots::CrossCheck`: the signals router consume loop ended abnormally: {err}");
        }

        let outcomes: Vec<UnitOutcome> = outcomes.into_iter()
            .zip(mail_servers)
            .map(|(outcome, mail_server)| outcome.unwrap_or_else(|| UnitOutcome {
                mail_server: mail_server.clone(),
                result:      Err(WorkError::Aborted(String::from("the work unit task was lost"))),
            }))
            .collect();
        Ok(CrossCheckReport::new(outcomes))
    }
}


/// How a single mailserver did
#[derive(Debug)]
pub struct UnitOutcome {
    pub mail_server: String,
    pub result:      Result<Retrieval, WorkError>,
}

/// Two mailservers' message counts, side by side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub server_a: String,
    pub count_a:  usize,
    pub server_b: String,
    pub count_b:  usize,
}

impl Comparison {
    pub fn matches(&self) -> bool {
        self.count_a == self.count_b
    }
}

/// Sorts `counts` by count (descending, ties keeping their order) and compares adjacent entries
pub fn compare_counts(counts: &[(String, usize)]) -> Vec<Comparison> {
    let mut sorted: Vec<&(String, usize)> = counts.iter().collect();
    sorted.sort_by(|(_, a), (_, b)| b.cmp(a));
    sorted.windows(2)
        .map(|pair| Comparison {
            server_a: pair[0].0.clone(),
            count_a:  pair[0].1,
            server_b: pair[1].0.clone(),
            count_b:  pair[1].1,
        })
        .collect()
}

/// The outcome of a [CrossCheck] run
#[derive(Debug)]
pub struct CrossCheckReport {
    pub outcomes:    Vec<UnitOutcome>,
    /// among the successful units only
    pub comparisons: Vec<Comparison>,
}

impl CrossCheckReport {

    pub fn new(outcomes: Vec<UnitOutcome>) -> Self {
        let counts: Vec<(String, usize)> = outcomes.iter()
            .filter_map(|outcome| outcome.result.as_ref().ok().map(|retrieval| (outcome.mail_server.clone(), retrieval.len())))
            .collect();
        let comparisons = compare_counts(&counts);
        Self { outcomes, comparisons }
    }

    /// The units that didn't complete their retrieval
    pub fn failed(&self) -> impl Iterator<Item=(&str, &WorkError)> {
        self.outcomes.iter()
            .filter_map(|outcome| outcome.result.as_ref().err().map(|err| (outcome.mail_server.as_str(), err)))
    }

    /// The successful servers whose message count differs from the best one -- the lagging ones
    pub fn divergent(&self) -> Vec<&str> {
        let retrieved = || self.outcomes.iter()
            .filter_map(|outcome| outcome.result.as_ref().ok().map(|retrieval| (outcome.mail_server.as_str(), retrieval.len())));
        let Some(best) = retrieved().map(|(_, count)| count).max() else {
            return vec![]
        };
        retrieved()
            .filter(|(_, count)| *count != best)
            .map(|(mail_server, _)| mail_server)
            .collect()
    }

    /// Every unit succeeded & every pair matched
    pub fn is_success(&self) -> bool {
        self.failed().next().is_none() && self.comparisons.iter().all(Comparison::matches)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Logs the human readable summary of the run
    pub fn log_summary(&self) {
        for comparison in &self.comparisons {
            info!("`mailserver-bots::CrossCheck`: {} vs {}: messages: {} vs {}{}",
                  comparison.server_a, comparison.server_b, comparison.count_a, comparison.count_b,
                  if comparison.matches() { "" } else { " -- MISMATCH" });
        }
        for (mail_server, err) in self.failed() {
            error!("`mailserver-bots::CrossCheck`: {mail_server} FAILED: {err}");
        }
        let divergent = self.divergent();
        if !divergent.is_empty() {
            error!("`mailserver-bots::CrossCheck`: lagging mailserver(s): {divergent:?}");
        }
        info!("`mailserver-bots::CrossCheck`: {} out of {} mailserver(s) checked successfully -- cross-check {}",
              self.outcomes.len() - self.failed().count(), self.outcomes.len(), if self.is_success() { "PASSED" } else { "FAILED" });
    }
}


/// A random contiguous slice of, at least, two of `mail_servers` (all of them if there are less than two)
pub fn pick_mail_servers(mail_servers: &[&str], rng: &mut impl Rng) -> Vec<String> {
    let len = mail_servers.len();
    if len <= 2 {
        return mail_servers.iter().map(|enode| enode.to_string()).collect()
    }
    let start = rng.gen_range(0..=len-2);
    let end = rng.gen_range(start+2..=len);
    mail_servers[start..end].iter()
        .map(|enode| enode.to_string())
        .collect()
}


/// Unit tests for our [cross_check](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use crate::{
        error::{NodeError, SetupStage},
        node::simulated::SimulatedFleet,
        types::{Hash, TimeRange},
        unit_test_utils::{fast_retrieval_config, next_base_port, test_node_config},
    };


    fn outcome(mail_server: &str, count: usize) -> UnitOutcome {
        UnitOutcome {
            mail_server: mail_server.to_string(),
            result:      Ok(Retrieval {
                mail_server:   mail_server.to_string(),
                request_id:    Hash([1; 32]),
                messages:      vec![],
                last_envelope: None,
                empty_range:   false,
            }),
        }.with_count(count)
    }

    impl UnitOutcome {
        fn with_count(mut self, count: usize) -> Self {
            if let Ok(retrieval) = &mut self.result {
                retrieval.messages = (0..count).map(|i| crate::types::ReceivedMessage {
                    hash:      Hash([i as u8; 32]),
                    topic:     Default::default(),
                    payload:   vec![],
                    sig:       vec![],
                    timestamp: i as u32,
                }).collect();
            }
            self
        }
    }

    fn counts(counts: &[(&str, usize)]) -> Vec<(String, usize)> {
        counts.iter().map(|(server, count)| (server.to_string(), *count)).collect()
    }


    #[cfg_attr(not(doc),test)]
    fn adjacent_comparisons() {
        let comparisons = compare_counts(&counts(&[("a", 3), ("b", 5), ("c", 4)]));
        assert_eq!(comparisons.iter().map(|c| (c.server_a.as_str(), c.server_b.as_str())).collect::<Vec<_>>(),
                   vec![("b", "c"), ("c", "a")],
                   "comparisons must follow the descending ranking");
        assert!(compare_counts(&counts(&[("a", 3)])).is_empty(), "a single server has nothing to be compared to");
    }

    /// [5,5,5] passes
    #[cfg_attr(not(doc),test)]
    fn consistent_servers_pass() {
        let report = CrossCheckReport::new(vec![outcome("a", 5), outcome("b", 5), outcome("c", 5)]);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert!(report.divergent().is_empty());
        report.log_summary();
    }

    /// [5,3,5] fails, naming the server with 3 messages
    #[cfg_attr(not(doc),test)]
    fn lagging_server_is_named() {
        let report = CrossCheckReport::new(vec![outcome("a", 5), outcome("b", 3), outcome("c", 5)]);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.divergent(), vec!["b"]);
    }

    /// [5,3,3] names both servers behind the best one -- not only the first of them
    #[cfg_attr(not(doc),test)]
    fn every_lagging_server_is_named() {
        let report = CrossCheckReport::new(vec![outcome("a", 5), outcome("b", 3), outcome("c", 3)]);
        assert!(report.comparisons[1].matches(), "b & c agree with each other");
        assert_eq!(report.divergent(), vec!["b", "c"]);
        assert_eq!(report.exit_code(), 1);
    }

    /// a run against honest simulated mailservers, each unit listening on its own port
    #[cfg_attr(not(doc),tokio::test)]
    async fn honest_fleet_run() {
        let mail_servers = vec![String::from("enode://a0@127.0.0.1:30504"), String::from("enode://a1@127.0.0.1:30505")];
        let fleet = SimulatedFleet::with_mail_servers(mail_servers.clone());
        fleet.seed(&[String::from("status")], 4, TimeRange { from: 1_000, to: 2_000 });
        let session = SessionConfig { time_range: TimeRange { from: 1_000, to: 2_000 }, channels: vec![String::from("status")] };
        let base_port = next_base_port();
        let cross_check = CrossCheck::new(Arc::new(fleet), test_node_config(), fast_retrieval_config())
            .with_base_port(base_port);
        assert_eq!(cross_check.work_units(&mail_servers)[1].node_config().listen_addr, format!("127.0.0.1:{}", base_port + 1));
        let report = cross_check.run(&mail_servers, session, &CancellationToken::new()).await
            .expect("running the cross-check");
        assert!(report.is_success(), "{report:?}");
        assert!(report.outcomes.iter().all(|outcome| matches!(&outcome.result, Ok(retrieval) if retrieval.len() == 4)));
    }

    /// a failed unit fails the run, while the others are still compared
    #[cfg_attr(not(doc),test)]
    fn failed_units_fail_the_run() {
        let failed = UnitOutcome {
            mail_server: String::from("b"),
            result:      Err(WorkError::setup(SetupStage::WaitForPeer)(NodeError::PeerNotConnected(String::from("b")))),
        };
        let report = CrossCheckReport::new(vec![outcome("a", 5), failed, outcome("c", 5)]);
        assert_eq!(report.comparisons.len(), 1, "only the successful units should be compared");
        assert!(report.divergent().is_empty());
        assert_eq!(report.failed().map(|(server, _)| server).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(report.exit_code(), 1);
    }

    #[cfg_attr(not(doc),test)]
    fn picks_at_least_two_contiguous_servers() {
        let fleet = ["m0", "m1", "m2", "m3", "m4", "m5"];
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let picked = pick_mail_servers(&fleet, &mut rng);
            assert!(picked.len() >= 2, "{picked:?}");
            let start = fleet.iter().position(|enode| *enode == picked[0]).expect("picked an unknown server");
            assert_eq!(picked, fleet[start..start+picked.len()].to_vec(), "the slice must be contiguous");
        }
        assert_eq!(pick_mail_servers(&fleet[..1], &mut rng), vec!["m0"]);
    }
}
