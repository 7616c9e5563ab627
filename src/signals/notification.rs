//! The node's raw notifications, decoded once into the closed [NodeSignal] type

use crate::types::Hash;
use std::str::FromStr;
use serde::Deserialize;
use serde_json::json;
use strum_macros::{AsRefStr, Display, EnumString};


/// The notification kinds we route
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum MailSignalKind {
    #[strum(serialize = "mailserver.request.completed")]
    RequestCompleted,
    #[strum(serialize = "mailserver.request.expired")]
    RequestExpired,
}

/// A notification about an outstanding mailserver request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncSignal {
    /// The mailserver finished answering: `last_envelope_id` is the hash of the last envelope it claims to have sent
    /// -- [Hash::ZERO] if it had nothing in the requested range
    RequestCompleted {
        request_id:       Hash,
        last_envelope_id: Hash,
        cursor:           Option<String>,
        error:            Option<String>,
    },
    /// The mailserver didn't answer within the request's timeout
    RequestExpired {
        request_id: Hash,
    },
}

impl AsyncSignal {

    /// The correlation key
    pub fn request_id(&self) -> Hash {
        match self {
            AsyncSignal::RequestCompleted { request_id, .. } |
            AsyncSignal::RequestExpired   { request_id }     => *request_id,
        }
    }

    pub fn kind(&self) -> MailSignalKind {
        match self {
            AsyncSignal::RequestCompleted { .. } => MailSignalKind::RequestCompleted,
            AsyncSignal::RequestExpired   { .. } => MailSignalKind::RequestExpired,
        }
    }

    /// Shortcut for a successful completion
    pub fn completed(request_id: Hash, last_envelope_id: Hash) -> Self {
        AsyncSignal::RequestCompleted { request_id, last_envelope_id, cursor: None, error: None }
    }

    pub fn expired(request_id: Hash) -> Self {
        AsyncSignal::RequestExpired { request_id }
    }
}

/// Any notification emitted by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSignal {
    Mail(AsyncSignal),
    /// Observed (logged) but not routed
    Other { kind: String },
}

impl NodeSignal {

    /// Decodes the node's JSON envelope `{"type": <kind>, "event": {...}}`
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        let envelope: RawEnvelope = serde_json::from_str(raw)?;
        let Ok(kind) = MailSignalKind::from_str(&envelope.kind) else {
            return Ok(NodeSignal::Other { kind: envelope.kind })
        };
        let signal = match kind {
            MailSignalKind::RequestCompleted => {
                let event: RequestCompletedEvent = serde_json::from_value(envelope.event)?;
                AsyncSignal::RequestCompleted {
                    request_id:       event.request_id,
                    last_envelope_id: event.last_envelope_hash,
                    cursor:           Some(event.cursor).filter(|cursor| !cursor.is_empty()),
                    error:            Some(event.error_message).filter(|error| !error.is_empty()),
                }
            },
            MailSignalKind::RequestExpired => {
                let event: RequestExpiredEvent = serde_json::from_value(envelope.event)?;
                AsyncSignal::RequestExpired { request_id: event.hash }
            },
        };
        Ok(NodeSignal::Mail(signal))
    }

    /// Encodes back into the node's JSON envelope -- the inverse of [Self::decode()]
    pub fn encode(&self) -> String {
        match self {
            NodeSignal::Mail(AsyncSignal::RequestCompleted { request_id, last_envelope_id, cursor, error }) =>
                envelope(MailSignalKind::RequestCompleted.as_ref(), json!({
                    "requestID":        request_id,
                    "lastEnvelopeHash": last_envelope_id,
                    "cursor":           cursor.as_deref().unwrap_or_default(),
                    "errorMessage":     error.as_deref().unwrap_or_default(),
                })),
            NodeSignal::Mail(AsyncSignal::RequestExpired { request_id }) =>
                envelope(MailSignalKind::RequestExpired.as_ref(), json!({ "hash": request_id })),
            NodeSignal::Other { kind } =>
                envelope(kind, json!({})),
        }
    }
}

impl From<AsyncSignal> for NodeSignal {
    fn from(signal: AsyncSignal) -> Self {
        NodeSignal::Mail(signal)
    }
}

fn envelope(kind: &str, event: serde_json::Value) -> String {
    json!({ "type": kind, "event": event }).to_string()
}


#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind:  String,
    #[serde(default)]
    event: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestCompletedEvent {
    #[serde(rename = "requestID")]
    request_id:         Hash,
    last_envelope_hash: Hash,
    #[serde(default)]
    cursor:             String,
    #[serde(default)]
    error_message:      String,
}

#[derive(Deserialize)]
struct RequestExpiredEvent {
    hash: Hash,
}


/// Unit tests for our [notification](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;


    const REQUEST_ID: &str = "0xa0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0";
    const LAST_HASH:  &str = "0x0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b";


    /// assures the envelopes, as emitted by the node, decode into the right variants
    #[cfg_attr(not(doc),test)]
    fn decodes_node_envelopes() {
        let raw = format!(r#"{{"type":"mailserver.request.completed","event":{{"requestID":"{REQUEST_ID}","lastEnvelopeHash":"{LAST_HASH}","cursor":"","errorMessage":""}}}}"#);
        let observed = NodeSignal::decode(&raw).expect("decoding a completion signal");
        let expected = NodeSignal::Mail(AsyncSignal::completed(Hash::from_hex(REQUEST_ID).unwrap(), Hash::from_hex(LAST_HASH).unwrap()));
        assert_eq!(observed, expected, "completion signal wasn't decoded correctly");

        // expiry signals carry the request id in the `hash` field
        let raw = format!(r#"{{"type":"mailserver.request.expired","event":{{"hash":"{REQUEST_ID}"}}}}"#);
        let observed = NodeSignal::decode(&raw).expect("decoding an expiry signal");
        assert_eq!(observed, NodeSignal::Mail(AsyncSignal::expired(Hash::from_hex(REQUEST_ID).unwrap())));

        let observed = NodeSignal::decode(r#"{"type":"node.ready","event":null}"#).expect("decoding an unrouted signal");
        assert_eq!(observed, NodeSignal::Other { kind: String::from("node.ready") });
    }

    #[cfg_attr(not(doc),test)]
    fn rejects_malformed_envelopes() {
        assert!(NodeSignal::decode("not json").is_err());
        assert!(NodeSignal::decode(r#"{"type":"mailserver.request.expired","event":{"hash":"0x12"}}"#).is_err(), "short hashes must be rejected");
        assert!(NodeSignal::decode(r#"{"type":"mailserver.request.completed","event":{}}"#).is_err(), "a completion without a request id is useless");
    }

    #[cfg_attr(not(doc),test)]
    fn encode_is_decodable() {
        let signal = NodeSignal::Mail(AsyncSignal::RequestCompleted {
            request_id:       Hash([1; 32]),
            last_envelope_id: Hash::ZERO,
            cursor:           Some(String::from("c0ffee")),
            error:            None,
        });
        assert_eq!(NodeSignal::decode(&signal.encode()).expect("decoding our own encoding"), signal);
    }
}
