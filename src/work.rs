//! Resting place for [RetrievalWorkUnit], which verifies a single mailserver answers a historic messages request completely.
//!
//! A unit drives its own (isolated) node through the whole retrieval:
//!   1. starts the node on a private data directory & attaches an RPC client to it;
//!   2. adds the mailserver as a peer, waiting for it to connect;
//!   3. derives the channels' keys & topics, subscribing for their messages;
//!   4. issues the request -- through a [crate::signals::Reservation], so no signal for it may be lost;
//!   5. runs the [event loop](run_event_loop) until it can tell whether the mailserver delivered everything it claimed to.
//!
//! Whatever happens, the node is stopped and the signals registration released before [RetrievalWorkUnit::execute()] returns.

use crate::{
    config::{NodeConfig, RetrievalConfig},
    error::{NodeError, SetupStage, WorkError},
    node::{MessagingNode, NodeLauncher, PeerEventKind, RpcClient},
    protocol::{public_chat_topic, MAIL_SERVER_PASSWORD},
    signals::{AsyncSignal, SignalFilter, SignalRouter},
    types::{Criteria, Hash, MessagesRequest, ReceivedMessage, TimeRange, Topic},
};
use std::{
    path::Path,
    sync::Arc,
    time::Duration,
};
use futures::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;


/// What to retrieve: the same for every mailserver of a cross-check
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub time_range: TimeRange,
    pub channels:   Vec<String>,
}

impl SessionConfig {

    /// Retrieval of the last `duration` of messages of `channels`, up to "now minus the configured safety margin"
    pub fn last(duration: Duration, channels: Vec<String>, config: &RetrievalConfig) -> Self {
        Self {
            time_range: TimeRange::up_to_now(duration, config.upper_bound_margin),
            channels,
        }
    }
}


/// The state of one outstanding historic messages request
#[derive(Debug)]
pub struct RequestSession {
    pub request_id:       Hash,
    pub target_server:    String,
    pub time_range:       TimeRange,
    pub topics:           Vec<Topic>,
    /// in arrival order
    pub collected:        Vec<ReceivedMessage>,
    /// the last envelope the mailserver claims to have sent -- known only after its completion signal
    pub last_expected_id: Option<Hash>,
}

impl RequestSession {

    pub fn new<IntoString: Into<String>>(request_id: Hash, target_server: IntoString, time_range: TimeRange, topics: Vec<Topic>) -> Self {
        Self {
            request_id,
            target_server: target_server.into(),
            time_range,
            topics,
            collected:        vec![],
            last_expected_id: None,
        }
    }

    /// Where, among the collected messages, the envelope `hash` is
    pub fn position_of(&self, hash: &Hash) -> Option<usize> {
        self.collected.iter()
            .position(|message| &message.hash == hash)
    }

    /// Decides the outcome once no more messages are coming: successful only if the last envelope
    /// announced by the completion signal was received
    pub fn verdict(&self) -> Result<Completion, WorkError> {
        match self.last_expected_id {
            Some(last_expected_id) => match self.position_of(&last_expected_id) {
                Some(position) => {
                    info!("`mailserver-bots::RetrievalWorkUnit`: received lastEnvelopeID {last_expected_id} on {position} out of {} from {}",
                          self.collected.len(), self.target_server);
                    Ok(Completion::Confirmed(last_expected_id))
                },
                None => Err(WorkError::Incomplete { expected: Some(last_expected_id), received: self.collected.len() }),
            },
            None => Err(WorkError::Incomplete { expected: None, received: self.collected.len() }),
        }
    }

    pub fn into_retrieval(self, completion: Completion) -> Retrieval {
        Retrieval {
            mail_server:   self.target_server,
            request_id:    self.request_id,
            messages:      self.collected,
            last_envelope: match completion {
                Completion::Confirmed(last_envelope) => Some(last_envelope),
                Completion::EmptyRange               => None,
            },
            empty_range:   completion == Completion::EmptyRange,
        }
    }
}

/// How a successful session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// the announced last envelope was among the received ones
    Confirmed(Hash),
    /// the mailserver reported having nothing in the requested range
    EmptyRange,
}

/// The outcome of a successful [RetrievalWorkUnit::execute()]
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub mail_server:   String,
    pub request_id:    Hash,
    pub messages:      Vec<ReceivedMessage>,
    pub last_envelope: Option<Hash>,
    pub empty_range:   bool,
}

impl Retrieval {
    /// How many messages were retrieved -- what cross-checks compare
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}


/// Retrieves the messages of a [SessionConfig] from a single mailserver -- see the [module docs](self)
pub struct RetrievalWorkUnit<Launcher: NodeLauncher> {
    launcher:    Arc<Launcher>,
    mail_server: String,
    node_config: NodeConfig,
    config:      RetrievalConfig,
}

impl<Launcher: NodeLauncher> RetrievalWorkUnit<Launcher> {

    /// `node_config.data_dir` is where the unit creates its own data directory -- or the system's temp dir, if empty
    pub fn new<IntoString: Into<String>>(launcher: Arc<Launcher>, mail_server: IntoString, node_config: NodeConfig, config: RetrievalConfig) -> Self {
        Self { launcher, mail_server: mail_server.into(), node_config, config }
    }

    pub fn mail_server(&self) -> &str {
        &self.mail_server
    }

    pub fn node_config(&self) -> &NodeConfig {
        &self.node_config
    }

    /// Runs the whole retrieval, returning the collected messages if the mailserver proved to have delivered all it had.\
    /// `router` must be started & is where the unit's node delivers its notifications.
    /// Cancelling `cancellation` interrupts any step, returning [WorkError::Cancelled] after the teardown.
    pub async fn execute(&self, session_config: &SessionConfig, router: &SignalRouter, cancellation: &CancellationToken) -> Result<Retrieval, WorkError> {
        if session_config.channels.is_empty() {
            return Err(WorkError::NoChannels)
        }
        let data_dir = create_data_dir(&self.node_config.data_dir)?;
        let mut node_config = self.node_config.clone();
        node_config.data_dir = data_dir.path().to_path_buf();
        debug!("`mailserver-bots::RetrievalWorkUnit`: using node config {node_config:?} for {}", self.mail_server);

        let node = tokio::select! {
            _ = cancellation.cancelled() => return Err(WorkError::Cancelled),
            node = self.launcher.start_node(&node_config, router.notification_sender()) => node.map_err(WorkError::setup(SetupStage::StartNode))?,
        };
        let result = tokio::select! {
            _ = cancellation.cancelled() => Err(WorkError::Cancelled),
            result = self.drive(&node, session_config, router, cancellation) => result,
        };
        if let Err(err) = node.stop().await {
            warn!("`mailserver-bots::RetrievalWorkUnit`: failed to stop the node used against {}: {err}", self.mail_server);
        }
        // `data_dir` is removed when dropped, after the node is no longer using it
        drop(data_dir);
        result
    }

    /// Steps 1..5 from the [module docs](self), from an already started `node`
    async fn drive(&self, node: &Launcher::Node, session_config: &SessionConfig, router: &SignalRouter, cancellation: &CancellationToken) -> Result<Retrieval, WorkError> {
        let rpc = node.attach_rpc().await
            .map_err(WorkError::setup(SetupStage::AttachRpc))?;
        node.add_peer(&self.mail_server).await
            .map_err(WorkError::setup(SetupStage::AddPeer))?;
        node.wait_for_peer(&self.mail_server, PeerEventKind::Add, self.config.peer_connect_timeout).await
            .map_err(WorkError::setup(SetupStage::WaitForPeer))?;

        // subscriptions must be active before the request is sent, or early deliveries would be lost
        let mut topics = Vec::with_capacity(session_config.channels.len());
        let mut subscriptions = Vec::with_capacity(session_config.channels.len());
        for channel in &session_config.channels {
            let sym_key_id = rpc.generate_sym_key_from_password(channel, self.config.channel_key_timeout).await
                .map_err(WorkError::setup(SetupStage::ChannelKey))?;
            let topic = public_chat_topic(channel.as_bytes());
            let subscription = rpc.subscribe_messages(Criteria::for_mail_server(sym_key_id, topic)).await
                .map_err(WorkError::setup(SetupStage::Subscribe))?;
            topics.push(topic);
            subscriptions.push(subscription);
        }
        let mail_server_key_id = rpc.generate_sym_key_from_password(MAIL_SERVER_PASSWORD, self.config.mail_server_key_timeout).await
            .map_err(WorkError::setup(SetupStage::MailServerKey))?;
        let mut messages = futures::stream::select_all(subscriptions);

        let request = MessagesRequest {
            mail_server_peer: self.mail_server.clone(),
            sym_key_id:       mail_server_key_id,
            from:             session_config.time_range.from,
            to:               session_config.time_range.to,
            limit:            self.config.limit,
            topics:           topics.clone(),
            timeout:          self.config.request_timeout,
        };
        let mut signals = router.reserve()
            .issue(async { rpc.request_messages(request).await.map_err(WorkError::setup(SetupStage::RequestMessages)) })
            .await?;
        info!("`mailserver-bots::RetrievalWorkUnit`: requested {} for messages of {:?} in {:?} -- request {}",
              self.mail_server, session_config.channels, session_config.time_range, signals.request_id());

        let mut session = RequestSession::new(signals.request_id(), self.mail_server.clone(), session_config.time_range, topics);
        let completion = run_event_loop(&mut session, &mut messages, &mut signals, self.config.quiescence_window, cancellation).await;
        signals.cancel();
        completion.map(|completion| session.into_retrieval(completion))
    }
}


/// Creates an ephemeral node data directory inside `base` -- or inside the system's temp dir if `base` is empty.\
/// The directory is removed when the returned value is dropped.
pub fn create_data_dir(base: &Path) -> Result<TempDir, WorkError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("mailserver-bots-");
    if base.as_os_str().is_empty() {
        builder.tempdir()
    } else {
        std::fs::create_dir_all(base)
            .and_then(|_| builder.tempdir_in(base))
    }.map_err(WorkError::DataDir)
}

/// Consumes `messages` & `signals` for `session` until a verdict is reached:
///   - each message is collected & restarts the `quiescence_window`;
///   - a completion signal records the last expected envelope -- succeeding at once if it is the empty range sentinel;
///   - an expiry signal, a subscription error or the end of all subscriptions fails at once;
///   - when the `quiescence_window` elapses, see [RequestSession::verdict()].
pub async fn run_event_loop<MessageStream>(session:           &mut RequestSession,
                                           messages:          &mut MessageStream,
                                           signals:           &mut SignalFilter,
                                           quiescence_window: Duration,
                                           cancellation:      &CancellationToken)
                                          -> Result<Completion, WorkError>
                                          where MessageStream: Stream<Item=Result<ReceivedMessage, NodeError>> + Unpin {
    let quiescence = tokio::time::sleep(quiescence_window);
    tokio::pin!(quiescence);
    let mut signals_open = true;
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return Err(WorkError::Cancelled),

            message = messages.next() => match message {
                Some(Ok(message)) => {
                    trace!("`mailserver-bots::RetrievalWorkUnit`: received a message {} from {}", message.hash, session.target_server);
                    session.collected.push(message);
                    quiescence.as_mut().reset(Instant::now() + quiescence_window);
                },
                Some(Err(err)) => return Err(WorkError::Subscription(err)),
                None => return Err(WorkError::Subscription(NodeError::Transport(String::from("every messages subscription ended")))),
            },

            signal = signals.recv(), if signals_open => match signal {
                Some(AsyncSignal::RequestCompleted { last_envelope_id, error, .. }) => {
                    if let Some(error) = error {
                        warn!("`mailserver-bots::RetrievalWorkUnit`: {} completed request {} with an error: {error}", session.target_server, session.request_id);
                    }
                    if last_envelope_id.is_zero() {
                        info!("`mailserver-bots::RetrievalWorkUnit`: {} reports nothing in {:?} ({} message(s) received)",
                              session.target_server, session.time_range, session.collected.len());
                        return Ok(Completion::EmptyRange)
                    }
                    debug!("`mailserver-bots::RetrievalWorkUnit`: {} completed request {}: lastEnvelopeID is {last_envelope_id}", session.target_server, session.request_id);
                    session.last_expected_id = Some(last_envelope_id);
                },
                Some(AsyncSignal::RequestExpired { request_id }) => return Err(WorkError::Expired { request_id }),
                None => signals_open = false,
            },

            // we can not predict when messages finish to come in
            _ = &mut quiescence => return session.verdict(),
        }
    }
}


/// Unit tests for our [work](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use crate::{
        node::simulated::{MailServerBehavior, SimulatedFleet},
        signals::RequestCorrelator,
        unit_test_utils::{fast_retrieval_config, test_node_config},
    };
    use futures::channel::mpsc;


    const QUIESCENCE: Duration = Duration::from_millis(100);
    const MAIL_SERVER: &str = "enode://aa@127.0.0.1:30504";


    fn message(n: u8) -> ReceivedMessage {
        ReceivedMessage { hash: Hash([n; 32]), topic: public_chat_topic(b"status"), payload: vec![n], sig: vec![], timestamp: n as u32 }
    }

    fn new_session() -> RequestSession {
        RequestSession::new(Hash([0xee; 32]), MAIL_SERVER, TimeRange { from: 0, to: 100 }, vec![public_chat_topic(b"status")])
    }

    /// Runs the event loop over messages & signals fed by the returned senders
    struct Harness {
        correlator: Arc<RequestCorrelator>,
        messages:   mpsc::UnboundedSender<Result<ReceivedMessage, NodeError>>,
        receiver:   mpsc::UnboundedReceiver<Result<ReceivedMessage, NodeError>>,
        filter:     SignalFilter,
        session:    RequestSession,
    }

    impl Harness {

        fn new() -> Self {
            let correlator = RequestCorrelator::new();
            let session = new_session();
            let filter = correlator.register(session.request_id).expect("registering");
            let (messages, receiver) = mpsc::unbounded();
            Self { correlator, messages, receiver, filter, session }
        }

        fn message(&self, n: u8) -> &Self {
            self.messages.unbounded_send(Ok(message(n))).expect("sending a message");
            self
        }

        fn signal(&self, signal: AsyncSignal) -> &Self {
            self.correlator.dispatch(signal);
            self
        }

        async fn run(&mut self, quiescence_window: Duration, cancellation: &CancellationToken) -> Result<Completion, WorkError> {
            run_event_loop(&mut self.session, &mut self.receiver, &mut self.filter, quiescence_window, cancellation).await
        }
    }


    /// the completion signal may come before, amid or after the messages: only the presence of the announced last one matters
    #[cfg_attr(not(doc),tokio::test)]
    async fn completion_confirmed_regardless_of_order() {
        let mut harness = Harness::new();
        let request_id = harness.session.request_id;
        harness.message(1)
               .signal(AsyncSignal::completed(request_id, Hash([3; 32])))
               .message(3)
               .message(2);
        let completion = harness.run(QUIESCENCE, &CancellationToken::new()).await.expect("the retrieval should be complete");
        assert_eq!(completion, Completion::Confirmed(Hash([3; 32])));
        assert_eq!(harness.session.collected.len(), 3);
        assert_eq!(harness.session.position_of(&Hash([3; 32])), Some(1));
    }

    /// "server answered but a message is missing" & "server never answered" are both incomplete retrievals, told apart by `expected`
    #[cfg_attr(not(doc),tokio::test)]
    async fn incomplete_retrievals() {
        let mut harness = Harness::new();
        let request_id = harness.session.request_id;
        harness.message(1)
               .message(2)
               .signal(AsyncSignal::completed(request_id, Hash([9; 32])));
        let result = harness.run(QUIESCENCE, &CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkError::Incomplete { expected: Some(hash), received: 2 }) if hash == Hash([9; 32])), "{result:?}");

        let mut harness = Harness::new();
        let result = harness.run(QUIESCENCE, &CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkError::Incomplete { expected: None, received: 0 })), "{result:?}");
    }

    /// the empty range sentinel succeeds without waiting for the quiescence window
    #[cfg_attr(not(doc),tokio::test)]
    async fn empty_range_shortcut() {
        let mut harness = Harness::new();
        let request_id = harness.session.request_id;
        harness.message(1)
               .signal(AsyncSignal::completed(request_id, Hash::ZERO));
        let completion = tokio::time::timeout(Duration::from_secs(2), harness.run(Duration::from_secs(60), &CancellationToken::new())).await
            .expect("the quiescence window should not have been waited for");
        assert_eq!(completion.expect("an empty range is a success"), Completion::EmptyRange);
    }

    /// expiry is always a failure -- even with the announced last envelope at hand
    #[cfg_attr(not(doc),tokio::test)]
    async fn expiry_always_fails() {
        let mut harness = Harness::new();
        let request_id = harness.session.request_id;
        harness.message(1)
               .signal(AsyncSignal::completed(request_id, Hash([1; 32])))
               .signal(AsyncSignal::expired(request_id));
        let result = harness.run(QUIESCENCE, &CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkError::Expired { request_id: id }) if id == request_id), "{result:?}");
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn subscription_failures() {
        let mut harness = Harness::new();
        harness.messages.unbounded_send(Err(NodeError::Transport(String::from("connection reset")))).expect("sending");
        let result = harness.run(QUIESCENCE, &CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkError::Subscription(NodeError::Transport(_)))), "{result:?}");

        let mut harness = Harness::new();
        harness.message(1);
        harness.messages.close_channel();
        let result = harness.run(Duration::from_secs(60), &CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkError::Subscription(_))), "the end of the subscriptions must be reported: {result:?}");
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn cancellation() {
        let mut harness = Harness::new();
        let cancellation = CancellationToken::new();
        let canceller = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = harness.run(Duration::from_secs(60), &cancellation).await;
        assert!(matches!(result, Err(WorkError::Cancelled)), "{result:?}");
    }

    /// a whole unit against an honest simulated mailserver
    #[cfg_attr(not(doc),tokio::test)]
    async fn execute_against_an_honest_mail_server() {
        let fleet = Arc::new(SimulatedFleet::new());
        fleet.add_mail_server(MAIL_SERVER, MailServerBehavior::Honest);
        let range = TimeRange { from: 1_000, to: 2_000 };
        let channels = vec![String::from("status"), String::from("dapps")];
        fleet.seed(&channels, 3, range);

        let router = SignalRouter::new();
        let _consume_loop = router.start().expect("starting the router");
        let unit = RetrievalWorkUnit::new(Arc::clone(&fleet), MAIL_SERVER, test_node_config(), fast_retrieval_config());
        let retrieval = unit.execute(&SessionConfig { time_range: range, channels }, &router, &CancellationToken::new()).await
            .expect("the retrieval should succeed");
        assert_eq!(retrieval.len(), 6, "both channels' messages should have been collected");
        assert!(retrieval.last_envelope.is_some() && !retrieval.empty_range);
        assert_eq!(router.correlator().registrations(), 0, "the registration must be released");
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn execute_requires_channels() {
        let fleet = Arc::new(SimulatedFleet::with_mail_servers([MAIL_SERVER]));
        let router = SignalRouter::new();
        let unit = RetrievalWorkUnit::new(fleet, MAIL_SERVER, test_node_config(), fast_retrieval_config());
        let result = unit.execute(&SessionConfig { time_range: TimeRange { from: 0, to: 1 }, channels: vec![] }, &router, &CancellationToken::new()).await;
        assert!(matches!(result, Err(WorkError::NoChannels)), "{result:?}");
    }
}
