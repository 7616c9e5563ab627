//! Common code for the bots' binaries: shared command line options, logging setup, interrupt handling
//! and the seeding of the simulated fleet they run against.

use crate::{
    config::{NodeConfig, RetrievalConfig, MAIN_NETWORK_ID},
    error::ConfigError,
    node::simulated::SimulatedFleet,
    types::TimeRange,
};
use std::path::PathBuf;
use log::{warn, error, LevelFilter};
use structopt::StructOpt;
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;


/// Verbosity levels, as accepted by `--verbosity` (case insensitive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum Verbosity {
    #[strum(to_string = "crit")]
    Crit,
    #[strum(to_string = "error")]
    Error,
    #[strum(to_string = "warning", serialize = "warn")]
    Warning,
    #[strum(to_string = "info")]
    Info,
    #[strum(to_string = "debug")]
    Debug,
    #[strum(to_string = "trace")]
    Trace,
}

impl Verbosity {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Crit |
            Verbosity::Error   => LevelFilter::Error,
            Verbosity::Warning => LevelFilter::Warn,
            Verbosity::Info    => LevelFilter::Info,
            Verbosity::Debug   => LevelFilter::Debug,
            Verbosity::Trace   => LevelFilter::Trace,
        }
    }
}


/// Options shared by every bot
#[derive(Debug, StructOpt)]
pub struct CommonOpts {
    /// directory for data (the system's temp dir if not given)
    #[structopt(short = "d", long = "datadir", default_value = "", parse(from_os_str))]
    pub datadir:       PathBuf,
    /// cluster fleet
    #[structopt(short = "f", long = "fleet", default_value = "eth.beta")]
    pub fleet:         String,
    /// verbosity level, options: crit, error, warning, info, debug, trace
    #[structopt(short = "v", long = "verbosity", default_value = "info")]
    pub verbosity:     Verbosity,
    /// a RON file overriding the retrieval timeouts & limits
    #[structopt(long = "config", parse(from_os_str))]
    pub config:        Option<PathBuf>,
    /// how many envelopes, per channel, the simulated mailservers are seeded with
    #[structopt(long = "sim-envelopes", default_value = "10")]
    pub sim_envelopes: usize,
}

impl CommonOpts {

    /// The defaults -- overridden by the `--config` file, if given
    pub fn retrieval_config(&self) -> Result<RetrievalConfig, ConfigError> {
        match &self.config {
            Some(path) => RetrievalConfig::load(path),
            None => Ok(RetrievalConfig::default()),
        }
    }

    pub fn node_config(&self) -> Result<NodeConfig, ConfigError> {
        let mut node_config = NodeConfig::new(&self.fleet, MAIN_NETWORK_ID)?;
        node_config.data_dir = self.datadir.clone();
        Ok(node_config)
    }
}


/// Installs the logger, filtering by `verbosity`
pub fn init_logging(verbosity: Verbosity) {
    simple_logger::SimpleLogger::new()
        .with_utc_timestamps()
        .with_level(verbosity.level_filter())
        .init()
        .unwrap_or_else(|_| eprintln!("--> LOGGER WAS ALREADY STARTED"));
}

/// A token cancelled when the process is interrupted (Ctrl-C / SIGINT) -- to be threaded into the running bots,
/// so they may tear down gracefully
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let interrupted = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("`mailserver-bots`: interrupted -- cancelling the running work");
                interrupted.cancel();
            },
            Err(err) => error!("`mailserver-bots`: unable to listen for interrupts: {err}"),
        }
    });
    token
}

/// A simulated fleet with `mail_servers` storing `per_channel` envelopes of each of `channels`, spread over `range`
pub fn seeded_fleet(mail_servers: &[String], channels: &[String], per_channel: usize, range: TimeRange) -> SimulatedFleet {
    let fleet = SimulatedFleet::with_mail_servers(mail_servers.iter().cloned());
    fleet.seed(channels, per_channel, range);
    fleet
}


/// Unit tests for our [cli](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use std::{io::Write, str::FromStr};


    #[cfg_attr(not(doc),test)]
    fn verbosity_levels() {
        assert_eq!(Verbosity::from_str("INFO"), Ok(Verbosity::Info), "levels are case insensitive");
        assert_eq!(Verbosity::from_str("warn").map(Verbosity::level_filter), Ok(LevelFilter::Warn));
        assert_eq!(Verbosity::from_str("crit").map(Verbosity::level_filter), Ok(LevelFilter::Error));
        assert_eq!(Verbosity::Warning.to_string(), "warning");
        assert!(Verbosity::from_str("loud").is_err());
    }

    #[cfg_attr(not(doc),test)]
    fn common_options() {
        let opts = CommonOpts::from_iter_safe(["bot", "-f", "eth.staging", "-v", "debug"]).expect("parsing the options");
        assert_eq!(opts.verbosity, Verbosity::Debug);
        assert_eq!(opts.retrieval_config().expect("defaults"), RetrievalConfig::default());
        assert_eq!(opts.node_config().expect("staging is a known fleet").trusted_mail_servers().len(), 2);

        let mut config_file = tempfile::NamedTempFile::new().expect("creating the config file");
        config_file.write_all(br#"(quiescence_window: "1s")"#).expect("writing the config file");
        let config_path = config_file.path().to_string_lossy().to_string();
        let opts = CommonOpts::from_iter_safe(["bot", "--config", config_path.as_str()]).expect("parsing the options");
        assert_eq!(opts.retrieval_config().expect("loading the config file").quiescence_window, std::time::Duration::from_secs(1));
        assert!(CommonOpts::from_iter_safe(["bot", "-f", "eth.nope"]).expect("parsing").node_config().is_err());
    }

    #[cfg_attr(not(doc),test)]
    fn seeding() {
        let mail_servers = vec![String::from("enode://aa@127.0.0.1:1"), String::from("enode://bb@127.0.0.1:2")];
        let fleet = seeded_fleet(&mail_servers, &[String::from("status")], 4, TimeRange { from: 0, to: 1000 });
        assert!(mail_servers.iter().all(|enode| fleet.stored_count(enode) == 4));
    }
}
