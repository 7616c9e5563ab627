//! An in-process simulation of a fleet of mailservers & of the nodes talking to them, implementing the [crate::node] seam.\
//! Used by the tests and to run the bots without a real node at hand.
//!
//! Each simulated mailserver stores envelopes and answers historic messages requests the way a real one is seen by the bots:
//! matching envelopes are delivered through the requesting node's subscriptions and a completion (or expiry) signal is emitted
//! through the node's notifications. [MailServerBehavior] allows simulating the misbehaviors the bots must detect.

use crate::{
    config::NodeConfig,
    error::NodeError,
    node::{MessageStream, MessagingNode, NodeLauncher, NotificationSender, PeerEventKind, RpcClient},
    protocol::{public_chat_topic, MAIL_SERVER_PASSWORD},
    signals::notification::{AsyncSignal, NodeSignal},
    types::{Criteria, Hash, KeyId, MessagesRequest, ReceivedMessage, TimeRange, Topic},
};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering::Relaxed},
    },
    time::Duration,
};
use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use log::{debug, info, trace};
use sha3::{Digest, Keccak256};


/// How long a simulated mailserver with [MailServerBehavior::Expire] takes to let a request expire
/// -- real nodes would wait for the request's whole timeout
pub const SIMULATED_EXPIRY_DELAY: Duration = Duration::from_millis(50);

/// How a simulated mailserver answers historic messages requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailServerBehavior {
    /// delivers every matching envelope, then signals completion naming the last one
    #[default]
    Honest,
    /// signals completion before delivering the envelopes
    SignalFirst,
    /// signals completion even before the request RPC returns its id
    SignalBeforeReply,
    /// signals completion naming an envelope it never delivers
    WithholdLast,
    /// delivers nothing & lets the request expire
    Expire,
    /// delivers the envelopes but never signals
    Silent,
}

/// An envelope as stored by mailservers
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEnvelope {
    pub hash:      Hash,
    /// the public channel it was published to -- also the password of the key it is encrypted with
    pub channel:   String,
    pub topic:     Topic,
    pub timestamp: u32,
    pub payload:   Vec<u8>,
    pub sig:       Vec<u8>,
}

impl StoredEnvelope {

    pub fn new(channel: &str, timestamp: u32, payload: &[u8], sig: &[u8]) -> Self {
        Self {
            hash:      envelope_hash(channel, timestamp, payload),
            channel:   channel.to_string(),
            topic:     public_chat_topic(channel.as_bytes()),
            timestamp,
            payload:   payload.to_vec(),
            sig:       sig.to_vec(),
        }
    }

    fn to_message(&self) -> ReceivedMessage {
        ReceivedMessage {
            hash:      self.hash,
            topic:     self.topic,
            payload:   self.payload.clone(),
            sig:       self.sig.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Deterministic envelope hashes: the same envelope has the same hash on every mailserver
pub fn envelope_hash(channel: &str, timestamp: u32, payload: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(channel.as_bytes());
    hasher.update([0u8]);
    hasher.update(timestamp.to_be_bytes());
    hasher.update(payload);
    Hash(hasher.finalize().into())
}


#[derive(Debug, Default)]
struct SimulatedMailServer {
    behavior:    MailServerBehavior,
    unreachable: bool,
    envelopes:   Vec<StoredEnvelope>,
}

#[derive(Default)]
struct FleetState {
    mail_servers: Mutex<HashMap<String, SimulatedMailServer>>,
    nodes:        Mutex<Vec<Weak<NodeState>>>,
}

impl FleetState {

    fn mail_servers(&self) -> MutexGuard<'_, HashMap<String, SimulatedMailServer>> {
        self.mail_servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_reachable(&self, enode: &str) -> bool {
        self.mail_servers().get(enode)
            .is_some_and(|mail_server| !mail_server.unreachable)
    }
}


/// The simulated fleet -- cheap to clone, all clones sharing the same mailservers
#[derive(Clone, Default)]
pub struct SimulatedFleet {
    state: Arc<FleetState>,
}

impl SimulatedFleet {

    pub fn new() -> Self {
        Self::default()
    }

    /// A fleet with honest mailservers at the given `enodes`
    pub fn with_mail_servers<IntoString: Into<String>>(enodes: impl IntoIterator<Item=IntoString>) -> Self {
        let fleet = Self::new();
        for enode in enodes {
            fleet.add_mail_server(enode, MailServerBehavior::Honest);
        }
        fleet
    }

    pub fn add_mail_server<IntoString: Into<String>>(&self, enode: IntoString, behavior: MailServerBehavior) {
        self.state.mail_servers().insert(enode.into(), SimulatedMailServer { behavior, ..SimulatedMailServer::default() });
    }

    pub fn set_behavior(&self, enode: &str, behavior: MailServerBehavior) {
        if let Some(mail_server) = self.state.mail_servers().get_mut(enode) {
            mail_server.behavior = behavior;
        }
    }

    /// Unreachable mailservers never complete the peer connection
    pub fn set_unreachable(&self, enode: &str, unreachable: bool) {
        if let Some(mail_server) = self.state.mail_servers().get_mut(enode) {
            mail_server.unreachable = unreachable;
        }
    }

    /// Stores an envelope in a single mailserver, returning its hash
    pub fn store(&self, enode: &str, channel: &str, timestamp: u32, payload: &[u8]) -> Hash {
        let envelope = StoredEnvelope::new(channel, timestamp, payload, &[]);
        let hash = envelope.hash;
        if let Some(mail_server) = self.state.mail_servers().get_mut(enode) {
            mail_server.envelopes.push(envelope);
        }
        hash
    }

    /// Publishes an envelope: every mailserver stores it & it is delivered, live, to the matching subscriptions
    /// of every running node connected to a reachable mailserver
    pub fn publish(&self, channel: &str, timestamp: u32, payload: &[u8], sig: &[u8]) -> Hash {
        let envelope = StoredEnvelope::new(channel, timestamp, payload, sig);
        for mail_server in self.state.mail_servers().values_mut() {
            mail_server.envelopes.push(envelope.clone());
        }
        let live_nodes: Vec<Arc<NodeState>> = {
            let mut nodes = self.state.nodes.lock().unwrap_or_else(PoisonError::into_inner);
            nodes.retain(|node| node.strong_count() > 0);
            nodes.iter().filter_map(Weak::upgrade).collect()
        };
        for node in live_nodes {
            let connected = node.peers().iter().any(|peer| self.state.is_reachable(peer));
            if connected && !node.stopped.load(Relaxed) {
                node.deliver(&envelope);
            }
        }
        envelope.hash
    }

    /// Publishes `per_channel` envelopes on each of `channels`, evenly spread over `range`
    pub fn seed(&self, channels: &[String], per_channel: usize, range: TimeRange) -> Vec<Hash> {
        let span = range.to.saturating_sub(range.from) as u64;
        let mut hashes = Vec::with_capacity(channels.len() * per_channel);
        for channel in channels {
            for i in 0..per_channel {
                let timestamp = range.from + (span * (i as u64 + 1) / (per_channel as u64 + 1)) as u32;
                hashes.push(self.publish(channel, timestamp, format!("message #{i} on #{channel}").as_bytes(), &[]));
            }
        }
        hashes
    }

    /// Makes the mailserver `enode` lose its `count` most recent envelopes -- simulating a lagging store
    pub fn forget_newest(&self, enode: &str, count: usize) {
        if let Some(mail_server) = self.state.mail_servers().get_mut(enode) {
            mail_server.envelopes.sort_by_key(|envelope| envelope.timestamp);
            let keep = mail_server.envelopes.len().saturating_sub(count);
            mail_server.envelopes.truncate(keep);
        }
    }

    pub fn stored_count(&self, enode: &str) -> usize {
        self.state.mail_servers().get(enode)
            .map_or(0, |mail_server| mail_server.envelopes.len())
    }

    pub fn mail_servers(&self) -> Vec<String> {
        let mut enodes: Vec<String> = self.state.mail_servers().keys().cloned().collect();
        enodes.sort();
        enodes
    }
}

#[async_trait]
impl NodeLauncher for SimulatedFleet {
    type Node = SimulatedNode;

    async fn start_node(&self, config: &NodeConfig, notifications: NotificationSender) -> Result<SimulatedNode, NodeError> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(NodeError::Start(String::from("no data directory given")))
        }
        // like real nodes, leave our config in the data dir
        let config_ron = ron::ser::to_string_pretty(config, ron::ser::PrettyConfig::default())
            .map_err(|err| NodeError::Start(format!("cannot serialize the node config: {err}")))?;
        tokio::fs::write(config.data_dir.join("node.ron"), config_ron).await
            .map_err(|err| NodeError::Start(format!("cannot write to the data dir '{}': {err}", config.data_dir.display())))?;
        let node_state = Arc::new(NodeState {
            listen_addr:   config.listen_addr.clone(),
            data_dir:      config.data_dir.clone(),
            notifications,
            peers:         Mutex::new(HashSet::new()),
            keys:          Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            stopped:       AtomicBool::new(false),
        });
        self.state.nodes.lock().unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&node_state));
        info!("`mailserver-bots::SimulatedNode`: node started @ {} (data dir '{}')", node_state.listen_addr, node_state.data_dir.display());
        node_state.signal(NodeSignal::Other { kind: String::from("node.started") });
        Ok(SimulatedNode { fleet: Arc::clone(&self.state), node: node_state })
    }
}


struct Subscription {
    password: String,
    topics:   Vec<Topic>,
    sender:   mpsc::UnboundedSender<Result<ReceivedMessage, NodeError>>,
}

struct NodeState {
    listen_addr:   String,
    data_dir:      PathBuf,
    notifications: NotificationSender,
    peers:         Mutex<HashSet<String>>,
    /// key id -> password
    keys:          Mutex<HashMap<KeyId, String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    stopped:       AtomicBool,
}

impl NodeState {

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.stopped.load(Relaxed) {
            Err(NodeError::Stopped)
        } else {
            Ok(())
        }
    }

    fn peers(&self) -> HashSet<String> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn password_for(&self, key_id: &KeyId) -> Option<String> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).get(key_id).cloned()
    }

    /// Hands `envelope` to the subscriptions able to decrypt it, returning how many did -- unsubscribing the dropped ones
    fn deliver(&self, envelope: &StoredEnvelope) -> usize {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|subscription| !subscription.sender.is_closed());
        subscriptions.iter()
            .filter(|subscription| subscription.password == envelope.channel && subscription.topics.contains(&envelope.topic))
            .filter(|subscription| subscription.sender.unbounded_send(Ok(envelope.to_message())).is_ok())
            .count()
    }

    fn signal(&self, signal: NodeSignal) {
        // nobody listening is fine: signals are fire & forget
        let _ = self.notifications.send(signal.encode());
    }
}


/// A running simulated node
pub struct SimulatedNode {
    fleet: Arc<FleetState>,
    node:  Arc<NodeState>,
}

impl SimulatedNode {
    pub fn listen_addr(&self) -> &str {
        &self.node.listen_addr
    }
}

#[async_trait]
impl MessagingNode for SimulatedNode {
    type Rpc = SimulatedRpc;

    async fn attach_rpc(&self) -> Result<SimulatedRpc, NodeError> {
        self.node.ensure_running()
            .map_err(|err| NodeError::Rpc(err.to_string()))?;
        Ok(SimulatedRpc { fleet: Arc::clone(&self.fleet), node: Arc::clone(&self.node) })
    }

    async fn add_peer(&self, enode: &str) -> Result<(), NodeError> {
        self.node.ensure_running()?;
        let Some((_node_id, address)) = enode.strip_prefix("enode://").and_then(|rest| rest.split_once('@')) else {
            return Err(NodeError::InvalidPeer { enode: enode.to_string(), reason: String::from("expected 'enode://<id>@<host>:<port>'") })
        };
        trace!("`mailserver-bots::SimulatedNode`: adding peer @ {address}");
        self.node.peers.lock().unwrap_or_else(PoisonError::into_inner)
            .insert(enode.to_string());
        Ok(())
    }

    async fn wait_for_peer(&self, enode: &str, event: PeerEventKind, timeout: Duration) -> Result<(), NodeError> {
        self.node.ensure_running()?;
        let connected = self.node.peers().contains(enode) && self.fleet.is_reachable(enode);
        let happened = match event {
            PeerEventKind::Add  => connected,
            PeerEventKind::Drop => !connected,
        };
        if happened {
            Ok(())
        } else {
            tokio::time::sleep(timeout).await;
            Err(NodeError::Timeout { what: format!("peer '{event}' event for {enode}"), timeout })
        }
    }

    async fn stop(&self) -> Result<(), NodeError> {
        self.node.ensure_running()?;
        self.node.stopped.store(true, Relaxed);
        self.node.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.node.peers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        info!("`mailserver-bots::SimulatedNode`: node @ {} stopped", self.node.listen_addr);
        Ok(())
    }
}


/// The RPC client of a [SimulatedNode]
pub struct SimulatedRpc {
    fleet: Arc<FleetState>,
    node:  Arc<NodeState>,
}

#[async_trait]
impl RpcClient for SimulatedRpc {

    async fn generate_sym_key_from_password(&self, password: &str, _timeout: Duration) -> Result<KeyId, NodeError> {
        self.node.ensure_running()?;
        let key_id = KeyId(hex::encode(rand::random::<[u8; 32]>()));
        self.node.keys.lock().unwrap_or_else(PoisonError::into_inner)
            .insert(key_id.clone(), password.to_string());
        Ok(key_id)
    }

    async fn subscribe_messages(&self, criteria: Criteria) -> Result<MessageStream, NodeError> {
        self.node.ensure_running()?;
        let password = self.node.password_for(&criteria.sym_key_id)
            .ok_or_else(|| NodeError::UnknownKey(criteria.sym_key_id.to_string()))?;
        let (sender, receiver) = mpsc::unbounded();
        self.node.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { password, topics: criteria.topics, sender });
        Ok(receiver.boxed())
    }

    async fn request_messages(&self, request: MessagesRequest) -> Result<Hash, NodeError> {
        self.node.ensure_running()?;
        let enode = &request.mail_server_peer;
        if !self.node.peers().contains(enode) || !self.fleet.is_reachable(enode) {
            return Err(NodeError::PeerNotConnected(enode.clone()))
        }
        if self.node.password_for(&request.sym_key_id).as_deref() != Some(MAIL_SERVER_PASSWORD) {
            return Err(NodeError::Rejected(String::from("the request must be signed with the mail server key")))
        }
        let (behavior, mut envelopes) = {
            let mail_servers = self.fleet.mail_servers();
            let Some(mail_server) = mail_servers.get(enode) else {
                return Err(NodeError::PeerNotConnected(enode.clone()))
            };
            let range = TimeRange { from: request.from, to: request.to };
            let envelopes: Vec<StoredEnvelope> = mail_server.envelopes.iter()
                .filter(|envelope| request.topics.contains(&envelope.topic) && range.contains(envelope.timestamp))
                .cloned()
                .collect();
            (mail_server.behavior, envelopes)
        };
        envelopes.sort_by_key(|envelope| envelope.timestamp);
        envelopes.truncate(request.limit as usize);

        let request_id = Hash(rand::random());
        debug!("`mailserver-bots::SimulatedRpc`: request {request_id} to {enode} ({behavior:?}) matches {} envelope(s)", envelopes.len());
        self.node.signal(NodeSignal::Other { kind: String::from("envelope.sent") });
        if behavior == MailServerBehavior::SignalBeforeReply {
            self.node.signal(AsyncSignal::completed(request_id, last_hash(&envelopes)).into());
        }
        tokio::spawn(answer(Arc::clone(&self.node), request_id, behavior, envelopes));
        Ok(request_id)
    }
}

fn last_hash(envelopes: &[StoredEnvelope]) -> Hash {
    envelopes.last()
        .map_or(Hash::ZERO, |envelope| envelope.hash)
}

/// The mailserver side of a request, as seen by the requesting node
async fn answer(node: Arc<NodeState>, request_id: Hash, behavior: MailServerBehavior, envelopes: Vec<StoredEnvelope>) {
    let completed = || NodeSignal::from(AsyncSignal::completed(request_id, last_hash(&envelopes)));
    async fn deliver_all(node: &NodeState, envelopes: &[StoredEnvelope]) {
        for envelope in envelopes {
            node.deliver(envelope);
            tokio::task::yield_now().await;
        }
    }
    match behavior {
        MailServerBehavior::Honest => {
            deliver_all(&node, &envelopes).await;
            node.signal(completed());
        },
        MailServerBehavior::SignalFirst => {
            node.signal(completed());
            deliver_all(&node, &envelopes).await;
        },
        MailServerBehavior::WithholdLast => {
            let delivered = envelopes.len().saturating_sub(1);
            deliver_all(&node, &envelopes[..delivered]).await;
            node.signal(completed());
        },
        MailServerBehavior::Expire => {
            tokio::time::sleep(SIMULATED_EXPIRY_DELAY).await;
            node.signal(AsyncSignal::expired(request_id).into());
        },
        MailServerBehavior::Silent |
        MailServerBehavior::SignalBeforeReply => deliver_all(&node, &envelopes).await,
    }
}


/// Unit tests for our [simulated](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use crate::config::{FLEET_BETA, MAIN_NETWORK_ID};


    const MAIL_SERVER: &str = "enode://aa@127.0.0.1:30504";


    async fn started_node(fleet: &SimulatedFleet, data_dir: &tempfile::TempDir) -> (SimulatedNode, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let mut config = NodeConfig::new(FLEET_BETA, MAIN_NETWORK_ID).expect("config");
        config.data_dir = data_dir.path().to_path_buf();
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let node = fleet.start_node(&config, sender).await.expect("starting the node");
        (node, receiver)
    }


    /// an honest mailserver delivers the matching envelopes, in order, and then signals naming the last one
    #[cfg_attr(not(doc),tokio::test)]
    async fn honest_request() {
        let fleet = SimulatedFleet::with_mail_servers([MAIL_SERVER]);
        fleet.store(MAIL_SERVER, "status", 20, b"second");
        let first = fleet.store(MAIL_SERVER, "status", 10, b"first");
        let last = fleet.store(MAIL_SERVER, "status", 30, b"third");
        fleet.store(MAIL_SERVER, "other", 15, b"other channel");
        fleet.store(MAIL_SERVER, "status", 99, b"out of range");

        let data_dir = tempfile::tempdir().expect("temp dir");
        let (node, mut notifications) = started_node(&fleet, &data_dir).await;
        assert!(data_dir.path().join("node.ron").exists(), "the node config should have been written to the data dir");
        node.add_peer(MAIL_SERVER).await.expect("adding peer");
        node.wait_for_peer(MAIL_SERVER, PeerEventKind::Add, Duration::from_secs(1)).await.expect("peer should connect");

        let rpc = node.attach_rpc().await.expect("attaching rpc");
        let channel_key = rpc.generate_sym_key_from_password("status", Duration::from_secs(1)).await.expect("channel key");
        let mail_key = rpc.generate_sym_key_from_password(MAIL_SERVER_PASSWORD, Duration::from_secs(1)).await.expect("mail key");
        let topic = public_chat_topic(b"status");
        let mut messages = rpc.subscribe_messages(Criteria::for_mail_server(channel_key, topic)).await.expect("subscribing");
        let request_id = rpc.request_messages(MessagesRequest {
            mail_server_peer: MAIL_SERVER.to_string(),
            sym_key_id:       mail_key,
            from:             0,
            to:               50,
            limit:            1000,
            topics:           vec![topic],
            timeout:          Duration::from_secs(30),
        }).await.expect("requesting");

        let received: Vec<Hash> = messages.by_ref().take(3).map(|message| message.expect("message").hash).collect().await;
        assert_eq!(received.first(), Some(&first));
        assert_eq!(received.last(), Some(&last));

        let completion = loop {
            let raw = notifications.recv().await.expect("notifications ended");
            if let NodeSignal::Mail(signal) = NodeSignal::decode(&raw).expect("decoding") {
                break signal
            }
        };
        assert_eq!(completion, AsyncSignal::completed(request_id, last));
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn unreachable_peer_times_out() {
        let fleet = SimulatedFleet::with_mail_servers([MAIL_SERVER]);
        fleet.set_unreachable(MAIL_SERVER, true);
        let data_dir = tempfile::tempdir().expect("temp dir");
        let (node, _notifications) = started_node(&fleet, &data_dir).await;
        assert!(matches!(node.add_peer("not an enode").await, Err(NodeError::InvalidPeer { .. })));
        node.add_peer(MAIL_SERVER).await.expect("adding peer");
        let result = node.wait_for_peer(MAIL_SERVER, PeerEventKind::Add, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(NodeError::Timeout { .. })), "{result:?}");
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn stopped_nodes_refuse_work() {
        let fleet = SimulatedFleet::with_mail_servers([MAIL_SERVER]);
        let data_dir = tempfile::tempdir().expect("temp dir");
        let (node, _notifications) = started_node(&fleet, &data_dir).await;
        let rpc = node.attach_rpc().await.expect("attaching rpc");
        node.stop().await.expect("stopping");
        assert_eq!(rpc.generate_sym_key_from_password("status", Duration::from_secs(1)).await, Err(NodeError::Stopped));
        assert!(node.attach_rpc().await.is_err());
    }

    #[cfg_attr(not(doc),test)]
    fn forgetting_envelopes() {
        let fleet = SimulatedFleet::with_mail_servers([MAIL_SERVER, "enode://bb@127.0.0.1:30505"]);
        let hashes = fleet.seed(&[String::from("status")], 5, TimeRange { from: 100, to: 200 });
        assert_eq!(hashes.len(), 5);
        fleet.forget_newest(MAIL_SERVER, 2);
        assert_eq!(fleet.stored_count(MAIL_SERVER), 3);
        assert_eq!(fleet.stored_count("enode://bb@127.0.0.1:30505"), 5);
        assert_eq!(envelope_hash("status", 1, b"x"), envelope_hash("status", 1, b"x"), "hashes must be deterministic");
    }
}
