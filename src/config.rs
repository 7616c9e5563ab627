//! Contains constants and other configuration information affecting default & fixed behaviors of the bots:
//!   * [RetrievalConfig] -- timeouts & limits for the historic messages retrieval, loadable from `.ron` files;
//!   * [NodeConfig] -- how each (isolated) node instance is set up;
//!   * the fleets table, with the trusted mailservers of each fleet.

use crate::error::ConfigError;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use once_cell::sync::Lazy;
use serde::{Serialize, Deserialize};


pub const FLEET_BETA:    &str = "eth.beta";
pub const FLEET_STAGING: &str = "eth.staging";

/// The main network id nodes are started with
pub const MAIN_NETWORK_ID: u64 = 1;


/// Timeouts & limits driving a [crate::work::RetrievalWorkUnit] (and the other bots sharing its steps).\
/// Usage example:
/// ```nocompile
///  let config = RetrievalConfig {
///     quiescence_window: Duration::from_secs(10),
///     ..RetrievalConfig::default()
///  };
/// ```
/// In `.ron` files, durations are written in the human form (`"5s"`, `"5m"`) and absent fields take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// How long to wait for the "peer added" event after adding the mailserver as a peer
    #[serde(with = "humantime_serde")]
    pub peer_connect_timeout:    Duration,
    /// Silence (no messages) after which we consider no more messages are coming -- restarted on every message
    #[serde(with = "humantime_serde")]
    pub quiescence_window:       Duration,
    /// Maximum number of messages the mailserver may answer with
    pub limit:                   u32,
    /// Hint given to the node on how long to wait for the mailserver before considering the request expired
    #[serde(with = "humantime_serde")]
    pub request_timeout:         Duration,
    /// Subtracted from "now" on the upper bound of the requested range, to cater for the envelopes' TTL & the clock skew on devices
    #[serde(with = "humantime_serde")]
    pub upper_bound_margin:      Duration,
    /// Deriving channels' keys can be really slow
    #[serde(with = "humantime_serde")]
    pub channel_key_timeout:     Duration,
    #[serde(with = "humantime_serde")]
    pub mail_server_key_timeout: Duration,
}

impl RetrievalConfig {

    /// Contains the defaults the bots were always run with
    pub const fn default() -> Self {
        Self {
            peer_connect_timeout:    Duration::from_secs(5),
            quiescence_window:       Duration::from_secs(5),
            limit:                   1000,
            request_timeout:         Duration::from_secs(30),
            upper_bound_margin:      Duration::from_secs(5*60),
            channel_key_timeout:     Duration::from_secs(10),
            mail_server_key_timeout: Duration::from_secs(1),
        }
    }

    /// Parses a `.ron` document -- fields not present keep their defaults
    pub fn from_ron(ron_str: &str, origin: &str) -> Result<Self, ConfigError> {
        ron::from_str(ron_str)
            .map_err(|source| ConfigError::Parse { path: origin.to_string(), source })
    }

    /// Loads a `.ron` config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ron_str = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_ron(&ron_str, &path.display().to_string())
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig::default()
    }
}


/// Configuration for a single (isolated) node instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub fleet:          String,
    pub network_id:     u64,
    /// Where the node keeps its data -- work units create their own ephemeral directory inside it (or in the system's temp dir, if empty)
    pub data_dir:       PathBuf,
    /// `host:port` -- port `0` for an ephemeral one
    pub listen_addr:    String,
    pub max_peers:      usize,
    pub no_discovery:   bool,
    pub whisper_enabled: bool,
}

impl NodeConfig {

    /// A config for the given `fleet`, isolated from the fleet's static nodes & discovery:
    /// peers are only the ones explicitly added
    pub fn new(fleet: &str, network_id: u64) -> Result<Self, ConfigError> {
        cluster_for_fleet(fleet)
            .ok_or_else(|| ConfigError::UnknownFleet(fleet.to_string()))?;
        Ok(Self {
            fleet:           fleet.to_string(),
            network_id,
            data_dir:        PathBuf::new(),
            listen_addr:     String::from(":0"),
            max_peers:       10,
            no_discovery:    true,
            whisper_enabled: true,
        })
    }

    /// The trusted mailservers of this config's fleet
    pub fn trusted_mail_servers(&self) -> &'static [&'static str] {
        cluster_for_fleet(&self.fleet)
            .map(|cluster| cluster.mail_servers.as_slice())
            .unwrap_or(&[])
    }
}


/// The nodes a fleet is made of -- we only care about its mailservers
#[derive(Debug)]
pub struct Cluster {
    pub mail_servers: Vec<&'static str>,
}

static CLUSTERS: Lazy<HashMap<&'static str, Cluster>> = Lazy::new(|| HashMap::from([
    (FLEET_STAGING, Cluster {
        mail_servers: vec![
            "enode://69f72baa7f1722d111a8c9c68c39a31430e9d567695f6108f31ccb6cd8f0adff4991e7fdca8fa770e75bc8a511a87d24690cbc80e008175f40c157d6f6788d48@206.189.240.16:30504",  // mail-01.do-ams3.eth.staging
            "enode://e4fc10c1f65c8aed83ac26bc1bfb21a45cc1a8550a58077c8d2de2a0e0cd18e40fd40f7e6f7d02dc6cd06982b014ce88d6e468725ffe2c138e958788d0002a7f@35.239.193.41:30504",   // mail-01.gc-us-central1-a.eth.staging
        ],
    }),
    (FLEET_BETA, Cluster {
        mail_servers: vec![
            "enode://c42f368a23fa98ee546fd247220759062323249ef657d26d357a777443aec04db1b29a3a22ef3e7c548e18493ddaf51a31b0aed6079bd6ebe5ae838fcfaf3a49@206.189.243.162:30504",  // mail-01.do-ams3.eth.beta
            "enode://7aa648d6e855950b2e3d3bf220c496e0cae4adfddef3e1e6062e6b177aec93bc6cdcf1282cb40d1656932ebfdd565729da440368d7c4da7dbd4d004b1ac02bf8@206.189.243.169:30504",  // mail-02.do-ams3.eth.beta
            "enode://8a64b3c349a2e0ef4a32ea49609ed6eb3364be1110253c20adc17a3cebbc39a219e5d3e13b151c0eee5d8e0f9a8ba2cd026014e67b41a4ab7d1d5dd67ca27427@206.189.243.168:30504",  // mail-03.do-ams3.eth.beta
            "enode://7de99e4cb1b3523bd26ca212369540646607c721ad4f3e5c821ed9148150ce6ce2e72631723002210fac1fd52dfa8bbdf3555e05379af79515e1179da37cc3db@35.188.19.210:30504",    // mail-01.gc-us-central1-a.eth.beta
            "enode://015e22f6cd2b44c8a51bd7a23555e271e0759c7d7f52432719665a74966f2da456d28e154e836bee6092b4d686fe67e331655586c57b718be3997c1629d24167@35.226.21.19:30504",     // mail-02.gc-us-central1-a.eth.beta
            "enode://531e252ec966b7e83f5538c19bf1cde7381cc7949026a6e499b6e998e695751aadf26d4c98d5a4eabfb7cefd31c3c88d600a775f14ed5781520a88ecd25da3c6@35.225.227.79:30504",    // mail-03.gc-us-central1-a.eth.beta
        ],
    }),
]));

/// Returns the cluster for a given fleet
pub fn cluster_for_fleet(fleet: &str) -> Option<&'static Cluster> {
    CLUSTERS.get(fleet)
}


/// Unit tests for our [config](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;


    #[cfg_attr(not(doc),test)]
    fn retrieval_config_from_ron() {
        let config = RetrievalConfig::from_ron(r#"(quiescence_window: "10s", limit: 50)"#, "inline")
            .expect("parsing a partial RON config");
        assert_eq!(config, RetrievalConfig {
            quiescence_window: Duration::from_secs(10),
            limit:             50,
            ..RetrievalConfig::default()
        }, "absent fields should keep their defaults");

        let err = RetrievalConfig::from_ron("(limit: \"many\")", "inline").expect_err("a wrongly typed field must fail");
        assert!(err.to_string().contains("inline"), "the error should name the config origin: {err}");
    }

    #[cfg_attr(not(doc),test)]
    fn retrieval_config_ron_round_trip() {
        let ron_str = ron::to_string(&RetrievalConfig::default()).expect("serializing the defaults");
        assert!(ron_str.contains("\"5m\""), "durations should be written in the human form: {ron_str}");
        assert_eq!(RetrievalConfig::from_ron(&ron_str, "defaults").expect("parsing our own output"), RetrievalConfig::default());
    }

    #[cfg_attr(not(doc),test)]
    fn fleets() {
        let config = NodeConfig::new(FLEET_BETA, MAIN_NETWORK_ID).expect("beta is a known fleet");
        assert_eq!(config.trusted_mail_servers().len(), 6);
        assert!(config.trusted_mail_servers().iter().all(|enode| enode.starts_with("enode://")));
        assert!(matches!(NodeConfig::new("eth.nope", MAIN_NETWORK_ID), Err(ConfigError::UnknownFleet(_))));
    }
}
