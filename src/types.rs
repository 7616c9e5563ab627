//! Common types used across this crate: identifiers, topics, time ranges and the
//! requests & messages exchanged with the node through the [crate::node] seam

use std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
    time::Duration,
};
use serde::{Serialize, Serializer, Deserialize, Deserializer, de::Error as _};


/// The size, in bytes, of envelope & request identifiers
pub const HASH_LENGTH: usize = 32;
/// The size, in bytes, of a [Topic]
pub const TOPIC_LENGTH: usize = 4;


/// A 32 bytes identifier -- the content hash of an envelope, which also identifies mailserver requests
/// (a request is, itself, an envelope sent to the mailserver).\
/// (De)serialized & displayed as `0x`-prefixed hex, like the node's JSON signals carry them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_LENGTH]);

impl Hash {

    /// The all-zero sentinel: a completion signal carrying it as the last envelope means
    /// "the mailserver has nothing in the requested range"
    pub const ZERO: Hash = Hash([0; HASH_LENGTH]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Parses `0x`-prefixed (or bare) hex, requiring exactly [HASH_LENGTH] bytes
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; HASH_LENGTH];
        hex::decode_to_slice(strip_hex_prefix(hex_str), &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Hash::from_hex(&hex_str)
            .map_err(|err| D::Error::custom(format!("invalid hash '{hex_str}': {err}")))
    }
}


/// A coarse routing / filtering key for envelopes -- see [crate::protocol::public_chat_topic()]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Topic(pub [u8; TOPIC_LENGTH]);

impl Topic {
    /// Builds a topic from the first [TOPIC_LENGTH] bytes of `bytes` (zero padded if shorter)
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut topic = [0u8; TOPIC_LENGTH];
        let len = bytes.len().min(TOPIC_LENGTH);
        topic[..len].copy_from_slice(&bytes[..len]);
        Self(topic)
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({self})")
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        let mut bytes = [0u8; TOPIC_LENGTH];
        hex::decode_to_slice(strip_hex_prefix(&hex_str), &mut bytes)
            .map_err(|err| D::Error::custom(format!("invalid topic '{hex_str}': {err}")))?;
        Ok(Self(bytes))
    }
}


/// The node-side handle of a symmetric key -- the key itself never leaves the node
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl Display for KeyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}


/// `(from, to)` bounds, in unix seconds, for historic messages requests
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: u32,
    pub to:   u32,
}

impl TimeRange {

    /// The range spanning the last `duration` up to `now`, with the upper bound clamped to `now - safety_margin`
    /// to tolerate the envelopes' TTL and the clock skew between us and the mailservers
    pub fn up_to(now: u32, duration: Duration, safety_margin: Duration) -> Self {
        let to   = now.saturating_sub(duration_as_secs_u32(safety_margin));
        let from = now.saturating_sub(duration_as_secs_u32(duration)).min(to);
        Self { from, to }
    }

    /// Same as [Self::up_to()], with `now` taken from the system clock
    pub fn up_to_now(duration: Duration, safety_margin: Duration) -> Self {
        Self::up_to(unix_now(), duration, safety_margin)
    }

    pub fn contains(&self, timestamp: u32) -> bool {
        (self.from..=self.to).contains(&timestamp)
    }
}

/// The current time, in unix seconds
pub fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

fn duration_as_secs_u32(duration: Duration) -> u32 {
    duration.as_secs().min(u32::MAX as u64) as u32
}


/// A message delivered by a subscription, already decrypted by the node
#[derive(Clone, PartialEq, Debug)]
pub struct ReceivedMessage {
    /// the hash of the envelope carrying this message
    pub hash:      Hash,
    pub topic:     Topic,
    pub payload:   Vec<u8>,
    /// the author's signature (public key), possibly empty for anonymous messages
    pub sig:       Vec<u8>,
    pub timestamp: u32,
}

/// Filter for [crate::node::RpcClient::subscribe_messages()]
#[derive(Clone, PartialEq, Debug)]
pub struct Criteria {
    pub sym_key_id: KeyId,
    pub topics:     Vec<Topic>,
    pub min_pow:    f64,
    /// also accept messages delivered directly by a peer (as mailservers do)
    pub allow_p2p:  bool,
}

impl Criteria {
    /// Criteria for messages of a public channel, as delivered by mailservers
    pub fn for_mail_server(sym_key_id: KeyId, topic: Topic) -> Self {
        Self { sym_key_id, topics: vec![topic], min_pow: 0.0, allow_p2p: true }
    }
}

/// Parameters for [crate::node::RpcClient::request_messages()]
#[derive(Clone, PartialEq, Debug)]
pub struct MessagesRequest {
    pub mail_server_peer: String,
    pub sym_key_id:       KeyId,
    pub from:             u32,
    pub to:               u32,
    pub limit:            u32,
    pub topics:           Vec<Topic>,
    /// how long the node should wait for the mailserver before emitting an "expired" signal
    pub timeout:          Duration,
}


fn strip_hex_prefix(hex_str: &str) -> &str {
    hex_str.strip_prefix("0x")
        .or_else(|| hex_str.strip_prefix("0X"))
        .unwrap_or(hex_str)
}


/// Unit tests for our [types](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;


    #[cfg_attr(not(doc),test)]
    fn hash_hex_forms() {
        let hex_str = "0x00000000000000000000000000000000000000000000000000000000000000ff";
        let hash = Hash::from_hex(hex_str).expect("parsing a well formed hash");
        assert_eq!(hash.0[31], 0xff, "last byte wasn't parsed");
        assert_eq!(hash.to_hex(), hex_str, "hex rendering should be the inverse of parsing");
        assert_eq!(Hash::from_hex(&hex_str[2..]), Ok(hash), "the `0x` prefix should be optional");
        assert!(Hash::from_hex("0x1234").is_err(), "short hashes must be rejected");
        assert!(Hash::ZERO.is_zero() && !hash.is_zero(), "zero sentinel detection is broken");
    }

    #[cfg_attr(not(doc),test)]
    fn hash_json() {
        let hash: Hash = serde_json::from_str("\"0x0101010101010101010101010101010101010101010101010101010101010101\"")
            .expect("deserializing a hash from JSON");
        assert_eq!(hash, Hash([1; HASH_LENGTH]));
        assert!(serde_json::from_str::<Hash>("\"not hex\"").is_err(), "garbage must not deserialize");
    }

    #[cfg_attr(not(doc),test)]
    fn time_range_is_clamped() {
        let now = 1_700_000_000;
        let range = TimeRange::up_to(now, Duration::from_secs(24*3600), Duration::from_secs(5*60));
        assert_eq!(range.to,   now - 300,     "upper bound must keep the safety margin from `now`");
        assert_eq!(range.from, now - 24*3600, "lower bound must span the whole duration");

        // a duration shorter than the margin must not produce an inverted range
        let range = TimeRange::up_to(now, Duration::from_secs(60), Duration::from_secs(5*60));
        assert!(range.from <= range.to, "inverted range: {range:?}");
        assert!(range.contains(range.to) && !range.contains(range.to + 1));
    }
}
