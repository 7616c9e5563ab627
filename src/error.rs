//! Error types for the node collaborator, the signals router and the work units.
//!
//! The taxonomy distinguishes what a caller needs to tell apart:
//!   * setup failures -- the unit never got to ask anything;
//!   * protocol failures -- the request expired server-side, or the subscription transport broke;
//!   * verification failures -- the mailserver answered, but the envelope it claimed to be the last one never arrived;
//!   * cancellation.

use crate::types::Hash;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;


/// Failures reported by the external messaging node (see [crate::node])
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("failed to start the node: {0}")]
    Start(String),
    #[error("failed to attach an rpc client: {0}")]
    Rpc(String),
    #[error("the node is stopped")]
    Stopped,
    #[error("invalid peer address '{enode}': {reason}")]
    InvalidPeer { enode: String, reason: String },
    #[error("peer '{0}' is not connected")]
    PeerNotConnected(String),
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("unknown symmetric key '{0}'")]
    UnknownKey(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("subscription transport error: {0}")]
    Transport(String),
}

/// Failures of the [crate::signals] request correlation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    /// two live sessions would share the same request identifier -- which should never happen in a correctly functioning correlator
    #[error("request {0} is already registered")]
    DuplicateRegistration(Hash),
    #[error("the signal router was already started")]
    AlreadyStarted,
}

/// The setup steps of a work unit -- see [WorkError::Setup]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SetupStage {
    #[strum(serialize = "start node")]
    StartNode,
    #[strum(serialize = "attach rpc")]
    AttachRpc,
    #[strum(serialize = "add peer")]
    AddPeer,
    #[strum(serialize = "wait for peer")]
    WaitForPeer,
    #[strum(serialize = "generate channel sym key")]
    ChannelKey,
    #[strum(serialize = "generate mail server sym key")]
    MailServerKey,
    #[strum(serialize = "subscribe for messages")]
    Subscribe,
    #[strum(serialize = "request messages")]
    RequestMessages,
}

/// How a work unit (or any bot built upon the same steps) may fail
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("failed to create the node data directory: {0}")]
    DataDir(#[source] std::io::Error),
    #[error("failed to {stage}: {source}")]
    Setup { stage: SetupStage, #[source] source: NodeError },
    #[error("no channels to request messages for")]
    NoChannels,
    #[error(transparent)]
    Registration(#[from] RouterError),
    #[error("request {request_id} for messages expired")]
    Expired { request_id: Hash },
    #[error("subscription for messages errored: {0}")]
    Subscription(#[source] NodeError),
    #[error("incomplete retrieval: did not receive lastEnvelopeID {} among {received} received messages",
            .expected.map(|hash| hash.to_string()).unwrap_or_else(|| String::from("(no completion signal)")))]
    Incomplete { expected: Option<Hash>, received: usize },
    #[error("cancelled")]
    Cancelled,
    #[error("work unit aborted: {0}")]
    Aborted(String),
}

impl WorkError {

    /// Returns a mapper from [NodeError] into [WorkError::Setup] for the given `stage` -- for use with `map_err()`
    pub fn setup(stage: SetupStage) -> impl FnOnce(NodeError) -> WorkError {
        move |source| WorkError::Setup { stage, source }
    }

    /// Tells if this error is a "the server answered, but something is missing" verification failure
    pub fn is_incomplete_retrieval(&self) -> bool {
        matches!(self, WorkError::Incomplete { .. })
    }
}

/// Failures loading configurations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown fleet '{0}'")]
    UnknownFleet(String),
    #[error("could not read config file '{path}': {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("could not parse config file '{path}': {source}")]
    Parse { path: String, #[source] source: ron::error::SpannedError },
}


/// Unit tests for our [error](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;


    /// "server never answered" & "server answered but a message is missing" must read differently
    #[cfg_attr(not(doc),test)]
    fn incomplete_retrieval_messages() {
        let never_answered = WorkError::Incomplete { expected: None, received: 0 };
        let missing = WorkError::Incomplete { expected: Some(Hash([7; 32])), received: 3 };
        assert!(never_answered.to_string().contains("no completion signal"), "{never_answered}");
        assert!(missing.to_string().contains(&Hash([7; 32]).to_string()), "{missing}");
        assert!(missing.is_incomplete_retrieval() && !WorkError::Cancelled.is_incomplete_retrieval());

        let setup = WorkError::setup(SetupStage::WaitForPeer)(NodeError::Timeout { what: String::from("peer"), timeout: Duration::from_secs(5) });
        assert_eq!(setup.to_string(), "failed to wait for peer: timed out after 5s waiting for peer");
    }
}
