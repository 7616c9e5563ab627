//! Resting place for [LoadTest], which floods a single mailserver with concurrent historic messages requests.
//!
//! A single node is connected to the mailserver and subscribed to the channel; then `concurrency` requests are issued
//! at once & each one is followed until its completion or expiry signal arrives -- or until the request timeout elapses.
//! The messages delivered meanwhile are only logged & counted: no completeness verification happens here
//! (see [crate::work] for that).

use crate::{
    config::{NodeConfig, RetrievalConfig},
    error::{NodeError, SetupStage, WorkError},
    node::{MessagingNode, NodeLauncher, PeerEventKind, RpcClient},
    protocol::{public_chat_topic, MAIL_SERVER_PASSWORD},
    signals::{AsyncSignal, SignalRouter},
    types::{unix_now, Criteria, MessagesRequest},
    work::create_data_dir,
};
use std::{
    sync::Arc,
    time::Duration,
};
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;


/// What to stress the mailserver with
#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    pub channel:     String,
    /// how far back from "now" each request reaches
    pub duration:    Duration,
    pub concurrency: usize,
}

/// How a single request of the load ended
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Completed,
    Expired,
    /// no signal arrived within the request timeout
    TimedOut,
    Failed(String),
}

/// Counters of a [LoadTest] run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadTestReport {
    pub requested:         usize,
    pub completed:         usize,
    pub expired:           usize,
    pub timed_out:         usize,
    pub failed:            usize,
    pub received_messages: usize,
}

impl LoadTestReport {

    fn record(&mut self, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Completed      => self.completed += 1,
            RequestOutcome::Expired        => self.expired   += 1,
            RequestOutcome::TimedOut       => self.timed_out += 1,
            RequestOutcome::Failed(reason) => {
                error!("`mailserver-bots::LoadTest`: request failed: {reason}");
                self.failed += 1
            },
        }
    }

    /// Every request completed
    pub fn is_success(&self) -> bool {
        self.completed == self.requested
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}


/// Stresses a mailserver -- see the [module docs](self)
pub struct LoadTest<Launcher: NodeLauncher> {
    launcher:    Arc<Launcher>,
    mail_server: String,
    node_config: NodeConfig,
    config:      RetrievalConfig,
}

impl<Launcher: NodeLauncher> LoadTest<Launcher> {

    pub fn new<IntoString: Into<String>>(launcher: Arc<Launcher>, mail_server: IntoString, node_config: NodeConfig, config: RetrievalConfig) -> Self {
        Self { launcher, mail_server: mail_server.into(), node_config, config }
    }

    /// Runs the load, returning once every request got its outcome
    pub async fn run(&self, load: &LoadConfig, cancellation: &CancellationToken) -> Result<LoadTestReport, WorkError> {
        let data_dir = create_data_dir(&self.node_config.data_dir)?;
        let mut node_config = self.node_config.clone();
        node_config.data_dir = data_dir.path().to_path_buf();
        info!("`mailserver-bots::LoadTest`: using node config {node_config:?}");

        let router = SignalRouter::new();
        let _consume_loop = router.start()?;
        let node = tokio::select! {
            _ = cancellation.cancelled() => return Err(WorkError::Cancelled),
            node = self.launcher.start_node(&node_config, router.notification_sender()) => node.map_err(WorkError::setup(SetupStage::StartNode))?,
        };
        let result = tokio::select! {
            _ = cancellation.cancelled() => Err(WorkError::Cancelled),
            result = self.drive(&node, &router, load) => result,
        };
        if let Err(err) = node.stop().await {
            warn!("`mailserver-bots::LoadTest`: failed to stop the node: {err}");
        }
        router.shutdown();
        result
    }

    async fn drive(&self, node: &Launcher::Node, router: &SignalRouter, load: &LoadConfig) -> Result<LoadTestReport, WorkError> {
        let rpc = node.attach_rpc().await
            .map_err(WorkError::setup(SetupStage::AttachRpc))?;

        debug!("`mailserver-bots::LoadTest`: subscribing for messages of #{}", load.channel);
        let topic = public_chat_topic(load.channel.as_bytes());
        let sym_key_id = rpc.generate_sym_key_from_password(&load.channel, self.config.channel_key_timeout).await
            .map_err(WorkError::setup(SetupStage::ChannelKey))?;
        let mut messages = rpc.subscribe_messages(Criteria::for_mail_server(sym_key_id, topic)).await
            .map_err(WorkError::setup(SetupStage::Subscribe))?;

        debug!("`mailserver-bots::LoadTest`: adding {} as a peer", self.mail_server);
        node.add_peer(&self.mail_server).await
            .map_err(WorkError::setup(SetupStage::AddPeer))?;
        node.wait_for_peer(&self.mail_server, PeerEventKind::Add, self.config.peer_connect_timeout).await
            .map_err(WorkError::setup(SetupStage::WaitForPeer))?;
        let mail_server_key_id = rpc.generate_sym_key_from_password(MAIL_SERVER_PASSWORD, self.config.mail_server_key_timeout).await
            .map_err(WorkError::setup(SetupStage::MailServerKey))?;

        info!("`mailserver-bots::LoadTest`: sending {} requests to {}", load.concurrency, self.mail_server);
        let now = unix_now();
        let request = MessagesRequest {
            mail_server_peer: self.mail_server.clone(),
            sym_key_id:       mail_server_key_id,
            from:             now.saturating_sub(load.duration.as_secs().min(u32::MAX as u64) as u32),
            to:               now,
            limit:            self.config.limit,
            topics:           vec![topic],
            timeout:          self.config.request_timeout,
        };
        let mut requests: FuturesUnordered<_> = (0..load.concurrency)
            .map(|_| request_once(&rpc, router, request.clone(), self.config.request_timeout))
            .collect();

        let mut report = LoadTestReport { requested: load.concurrency, ..LoadTestReport::default() };
        loop {
            tokio::select! {
                outcome = requests.next() => match outcome {
                    Some(outcome) => report.record(outcome),
                    None => break,
                },
                message = messages.next() => match message {
                    Some(Ok(message)) => {
                        report.received_messages += 1;
                        debug!("`mailserver-bots::LoadTest`: received a message: topic={} data={} author={}",
                               message.topic, String::from_utf8_lossy(&message.payload), hex::encode(&message.sig));
                    },
                    Some(Err(err)) => return Err(WorkError::Subscription(err)),
                    None => return Err(WorkError::Subscription(NodeError::Transport(String::from("the messages subscription ended")))),
                },
            }
        }
        // messages delivered before the last signal may still be queued
        while let Some(Some(Ok(_message))) = messages.next().now_or_never() {
            report.received_messages += 1;
        }
        info!("`mailserver-bots::LoadTest`: result: {report:?}");
        Ok(report)
    }
}

/// Issues a single request (through a reservation, so its signal can't be missed) and waits for its signal
async fn request_once<Rpc: RpcClient>(rpc: &Rpc, router: &SignalRouter, request: MessagesRequest, timeout: Duration) -> RequestOutcome {
    let issued = router.reserve()
        .issue(async { rpc.request_messages(request).await.map_err(WorkError::setup(SetupStage::RequestMessages)) })
        .await;
    let mut signals = match issued {
        Ok(signals) => signals,
        Err(err) => return RequestOutcome::Failed(err.to_string()),
    };
    debug!("`mailserver-bots::LoadTest`: requested for messages with a request hash: {}", signals.request_id());
    match tokio::time::timeout(timeout, signals.recv()).await {
        Ok(Some(AsyncSignal::RequestCompleted { .. })) => RequestOutcome::Completed,
        Ok(Some(AsyncSignal::RequestExpired { .. }))   => RequestOutcome::Expired,
        Ok(None) | Err(_)                              => RequestOutcome::TimedOut,
    }
}


/// Unit tests for our [bench](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use crate::{
        node::simulated::{MailServerBehavior, SimulatedFleet},
        types::TimeRange,
        unit_test_utils::{fast_retrieval_config, test_node_config},
    };


    const MAIL_SERVER: &str = "enode://aa@127.0.0.1:30504";


    fn load() -> LoadConfig {
        LoadConfig { channel: String::from("status"), duration: Duration::from_secs(3600), concurrency: 5 }
    }


    /// every request of the load gets its own completion signal
    #[cfg_attr(not(doc),tokio::test)]
    async fn honest_mail_server_completes_everything() {
        let fleet = Arc::new(SimulatedFleet::with_mail_servers([MAIL_SERVER]));
        let now = unix_now();
        fleet.seed(&[String::from("status")], 2, TimeRange { from: now - 600, to: now - 10 });
        let load_test = LoadTest::new(fleet, MAIL_SERVER, test_node_config(), fast_retrieval_config());
        let report = load_test.run(&load(), &CancellationToken::new()).await.expect("running the load");
        assert_eq!(report.completed, 5, "{report:?}");
        assert!(report.is_success());
        assert_eq!(report.received_messages, 10, "each request delivers both messages again");
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn expiring_and_silent_mail_servers() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.add_mail_server(MAIL_SERVER, MailServerBehavior::Expire);
        let load_test = LoadTest::new(Arc::clone(&fleet), MAIL_SERVER, test_node_config(), fast_retrieval_config());
        let report = load_test.run(&load(), &CancellationToken::new()).await.expect("running the load");
        assert_eq!((report.expired, report.exit_code()), (5, 1), "{report:?}");

        fleet.set_behavior(MAIL_SERVER, MailServerBehavior::Silent);
        let report = load_test.run(&load(), &CancellationToken::new()).await.expect("running the load");
        assert_eq!(report.timed_out, 5, "{report:?}");
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn unreachable_mail_server_is_a_setup_error() {
        let fleet = Arc::new(SimulatedFleet::with_mail_servers([MAIL_SERVER]));
        fleet.set_unreachable(MAIL_SERVER, true);
        let load_test = LoadTest::new(fleet, MAIL_SERVER, test_node_config(), fast_retrieval_config());
        let result = load_test.run(&load(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkError::Setup { stage: SetupStage::WaitForPeer, .. })), "{result:?}");
    }
}
