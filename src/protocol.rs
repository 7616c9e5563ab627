//! Chat protocol conventions shared by the bots: how public channels map to topics & keys

use crate::types::Topic;
use sha3::{Digest, Keccak256};


/// The well-known password from which the symmetric key used to talk to mailservers is derived
pub const MAIL_SERVER_PASSWORD: &str = "status-offline-inbox";

/// Returns the topic for the public channel `name`: the first 4 bytes of its Keccak-256 hash.\
/// Public channels also use their names as the password for their symmetric keys.
pub fn public_chat_topic(name: &[u8]) -> Topic {
    let hash = Keccak256::digest(name);
    Topic::from_slice(&hash)
}


/// Unit tests for our [protocol](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;


    /// the topic must be the truncated legacy Keccak-256 (not SHA3-256) -- otherwise we would not interoperate
    #[cfg_attr(not(doc),test)]
    fn topic_is_truncated_keccak() {
        // keccak256("") = c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470
        assert_eq!(public_chat_topic(b"").to_string(), "0xc5d24601");
        assert_eq!(public_chat_topic(b"status"), public_chat_topic(b"status"), "topics must be deterministic");
        assert_ne!(public_chat_topic(b"status"), public_chat_topic(b"status-core"), "different channels should not collide");
    }
}
