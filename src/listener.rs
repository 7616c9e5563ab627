//! Resting place for [PublicChannelListener], which follows public channels live, counting their messages per chat & author.

use crate::{
    config::{NodeConfig, RetrievalConfig},
    error::{NodeError, SetupStage, WorkError},
    metrics::LabeledCounter,
    node::{MessagingNode, NodeLauncher, PeerEventKind, RpcClient},
    protocol::public_chat_topic,
    signals::SignalRouter,
    types::{Criteria, ReceivedMessage, Topic},
    work::create_data_dir,
};
use std::{
    collections::HashMap,
    sync::Arc,
};
use futures::StreamExt;
use log::{info, warn};
use tokio_util::sync::CancellationToken;


/// The public chats always listened to
pub const DEFAULT_PUBLIC_CHATS: [&str; 5] = ["status", "status-core", "dapps", "ethereum", "crypto"];

/// Name reported for messages whose topic is not a tracked channel's
pub const UNKNOWN_CHAT: &str = "unknown";


/// The default public chats followed by `extra` ones -- without repetitions
pub fn tracked_channels(extra: &[String]) -> Vec<String> {
    let mut channels: Vec<String> = DEFAULT_PUBLIC_CHATS.iter().map(|chat| chat.to_string()).collect();
    for channel in extra {
        if !channels.contains(channel) {
            channels.push(channel.clone());
        }
    }
    channels
}

/// Allows telling a message's channel by its topic
pub fn topics_to_names(names: &[String]) -> HashMap<Topic, String> {
    names.iter()
        .map(|name| (public_chat_topic(name.as_bytes()), name.clone()))
        .collect()
}


/// Listens to public channels until cancelled -- logging each message & counting it in a [LabeledCounter]
/// labeled by chat & source (the author's signature, hex encoded)
pub struct PublicChannelListener<Launcher: NodeLauncher> {
    launcher:    Arc<Launcher>,
    node_config: NodeConfig,
    config:      RetrievalConfig,
    channels:    Vec<String>,
    /// the nodes messages are relayed from
    peers:       Vec<String>,
    counter:     Arc<LabeledCounter>,
}

impl<Launcher: NodeLauncher> PublicChannelListener<Launcher> {

    pub fn new(launcher: Arc<Launcher>, node_config: NodeConfig, config: RetrievalConfig, channels: Vec<String>, peers: Vec<String>, counter: Arc<LabeledCounter>) -> Self {
        Self { launcher, node_config, config, channels, peers, counter }
    }

    pub fn counter(&self) -> &Arc<LabeledCounter> {
        &self.counter
    }

    /// Listens until `cancellation` is cancelled, returning how many messages were received.\
    /// Only a subscription failure (or any setup one) ends the listening earlier.
    pub async fn run(&self, cancellation: &CancellationToken) -> Result<u64, WorkError> {
        let data_dir = create_data_dir(&self.node_config.data_dir)?;
        let mut node_config = self.node_config.clone();
        node_config.data_dir = data_dir.path().to_path_buf();
        info!("`mailserver-bots::PublicChannelListener`: using node config {node_config:?}");

        // no requests are issued: the router is here only to observe the node's signals
        let router = SignalRouter::new();
        let _consume_loop = router.start()?;
        let node = tokio::select! {
            _ = cancellation.cancelled() => return Err(WorkError::Cancelled),
            node = self.launcher.start_node(&node_config, router.notification_sender()) => node.map_err(WorkError::setup(SetupStage::StartNode))?,
        };
        let result = self.listen(&node, cancellation).await;
        if let Err(err) = node.stop().await {
            warn!("`mailserver-bots::PublicChannelListener`: failed to stop the node: {err}");
        }
        router.shutdown();
        result
    }

    async fn listen(&self, node: &Launcher::Node, cancellation: &CancellationToken) -> Result<u64, WorkError> {
        let rpc = node.attach_rpc().await
            .map_err(WorkError::setup(SetupStage::AttachRpc))?;
        for peer in &self.peers {
            let connected = match node.add_peer(peer).await {
                Ok(()) => node.wait_for_peer(peer, PeerEventKind::Add, self.config.peer_connect_timeout).await,
                Err(err) => Err(err),
            };
            // listening goes on as long as any peer relays
            if let Err(err) = connected {
                warn!("`mailserver-bots::PublicChannelListener`: couldn't connect to {peer}: {err}");
            }
        }

        info!("`mailserver-bots::PublicChannelListener`: tracked channels: {:?}", self.channels);
        let names = topics_to_names(&self.channels);
        let mut subscriptions = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let sym_key_id = rpc.generate_sym_key_from_password(channel, self.config.channel_key_timeout).await
                .map_err(WorkError::setup(SetupStage::ChannelKey))?;
            let criteria = Criteria { min_pow: 0.001, allow_p2p: false, ..Criteria::for_mail_server(sym_key_id, public_chat_topic(channel.as_bytes())) };
            subscriptions.push(rpc.subscribe_messages(criteria).await
                .map_err(WorkError::setup(SetupStage::Subscribe))?);
        }
        let mut messages = futures::stream::select_all(subscriptions);

        info!("`mailserver-bots::PublicChannelListener`: waiting for messages...");
        let mut received = 0;
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                message = messages.next() => match message {
                    Some(Ok(message)) => {
                        self.count(&message, &names);
                        received += 1;
                    },
                    Some(Err(err)) => return Err(WorkError::Subscription(err)),
                    None => return Err(WorkError::Subscription(NodeError::Transport(String::from("every messages subscription ended")))),
                },
            }
        }
        info!("`mailserver-bots::PublicChannelListener`: stopped listening after {received} message(s)");
        Ok(received)
    }

    fn count(&self, message: &ReceivedMessage, names: &HashMap<Topic, String>) {
        let chat = names.get(&message.topic)
            .map_or(UNKNOWN_CHAT, String::as_str);
        let source = hex::encode(&message.sig);
        info!("`mailserver-bots::PublicChannelListener`: received a message: topic={} ({chat}) data={} author={source}",
              message.topic, String::from_utf8_lossy(&message.payload));
        self.counter.inc(chat, &source);
    }
}


/// Unit tests for our [listener](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use crate::{
        node::simulated::SimulatedFleet,
        types::unix_now,
        unit_test_utils::{fast_retrieval_config, test_node_config},
    };
    use std::time::Duration;


    const MAIL_SERVER: &str = "enode://aa@127.0.0.1:30504";


    #[cfg_attr(not(doc),test)]
    fn channel_names() {
        let channels = tracked_channels(&[String::from("status"), String::from("my-chat")]);
        assert_eq!(channels.len(), DEFAULT_PUBLIC_CHATS.len() + 1, "repeated channels must not be tracked twice");
        let names = topics_to_names(&channels);
        assert_eq!(names.get(&public_chat_topic(b"my-chat")).map(String::as_str), Some("my-chat"));
    }

    /// live messages are counted by chat & author until the listener is cancelled
    #[cfg_attr(not(doc),tokio::test)]
    async fn counts_live_messages() {
        let fleet = Arc::new(SimulatedFleet::with_mail_servers([MAIL_SERVER]));
        let counter = Arc::new(LabeledCounter::messages_total());
        let listener = PublicChannelListener::new(Arc::clone(&fleet), test_node_config(), fast_retrieval_config(),
                                                  tracked_channels(&[String::from("my-chat")]), vec![String::from(MAIL_SERVER)], Arc::clone(&counter));
        let cancellation = CancellationToken::new();
        let listening = {
            let cancellation = cancellation.clone();
            tokio::spawn(async move { listener.run(&cancellation).await })
        };

        // publish until the listener is subscribed
        let now = unix_now();
        for attempt in 0..200u32 {
            if counter.total() > 0 {
                break
            }
            fleet.publish("status", now + attempt, b"hello", &[0xab]);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let counted_on_status = counter.get("status", "ab");
        assert!(counted_on_status > 0, "no live messages were counted");
        fleet.publish("my-chat", now, b"hi", &[0xcd]);
        fleet.publish("not-tracked", now, b"psst", &[0xef]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();

        let received = listening.await.expect("the listener panicked").expect("the listener failed");
        assert_eq!(counter.get("my-chat", "cd"), 1);
        assert_eq!(counter.total(), received, "every received message must have been counted");
        assert_eq!(counter.get(UNKNOWN_CHAT, "ef"), 0, "untracked channels must not be received");
    }
}
