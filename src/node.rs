//! The seam to the external messaging node -- treated as a black box exposing only what the bots need:
//!   * starting an isolated node & attaching an RPC client to it -- [NodeLauncher] & [MessagingNode];
//!   * adding a peer and waiting (with a timeout) for it to connect;
//!   * deriving symmetric keys, subscribing to messages & requesting historic messages -- [RpcClient];
//!   * an out-of-band stream of raw notifications ("signals"), delivered through the [NotificationSender]
//!     given when the node is started -- see [crate::signals::SignalRouter].
//!
//! [simulated] provides an in-process fleet of mailservers implementing this seam.

pub mod simulated;

use crate::{
    config::NodeConfig,
    error::NodeError,
    types::{Criteria, Hash, KeyId, MessagesRequest, ReceivedMessage},
};
use std::time::Duration;
use async_trait::async_trait;
use futures::stream::BoxStream;
use strum_macros::Display;


/// Where a node delivers its raw (JSON) notifications
pub type NotificationSender = tokio::sync::mpsc::UnboundedSender<String>;

/// Messages delivered by a subscription: an `Err` item reports the subscription's transport failure.\
/// Dropping the stream unsubscribes.
pub type MessageStream = BoxStream<'static, Result<ReceivedMessage, NodeError>>;

/// Peer events one may wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PeerEventKind {
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "drop")]
    Drop,
}


/// Starts messaging nodes
#[async_trait]
pub trait NodeLauncher: Send + Sync + 'static {
    type Node: MessagingNode;

    /// Starts a node bound to `config.data_dir` & `config.listen_addr`, wiring its notifications to `notifications`
    async fn start_node(&self, config: &NodeConfig, notifications: NotificationSender) -> Result<Self::Node, NodeError>;
}

/// A running node instance
#[async_trait]
pub trait MessagingNode: Send + Sync + 'static {
    type Rpc: RpcClient;

    async fn attach_rpc(&self) -> Result<Self::Rpc, NodeError>;

    async fn add_peer(&self, enode: &str) -> Result<(), NodeError>;

    /// Blocks until `event` happens for the `enode` peer -- or until `timeout` elapses, returning [NodeError::Timeout]
    async fn wait_for_peer(&self, enode: &str, event: PeerEventKind, timeout: Duration) -> Result<(), NodeError>;

    async fn stop(&self) -> Result<(), NodeError>;
}

/// The RPC API of a node
#[async_trait]
pub trait RpcClient: Send + Sync + 'static {

    /// Derives a symmetric key from `password`, returning the node-side handle for it
    async fn generate_sym_key_from_password(&self, password: &str, timeout: Duration) -> Result<KeyId, NodeError>;

    /// Starts delivering messages matching `criteria`
    async fn subscribe_messages(&self, criteria: Criteria) -> Result<MessageStream, NodeError>;

    /// Asks a mailserver for historic messages, returning the request identifier.\
    /// The outcome is only known through a later "request completed" or "request expired" signal,
    /// while the messages themselves come through the subscriptions.
    async fn request_messages(&self, request: MessagesRequest) -> Result<Hash, NodeError>;
}
