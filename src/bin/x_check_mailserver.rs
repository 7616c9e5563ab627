//! Cross-checks the historic messages several mailservers hold for the same channels & time span,
//! exiting with a non-zero status if any of them failed or lags behind the others.

use mailserver_bots::prelude::*;
use std::{sync::Arc, time::Duration};
use log::info;
use structopt::StructOpt;


#[derive(Debug, StructOpt)]
#[structopt(name = "x-check-mailserver", about = "Cross-checks the historic messages retrieval of mailservers")]
struct Opts {
    #[structopt(flatten)]
    common:      CommonOpts,
    /// a list of mail servers (by default, a random slice of the fleet's)
    #[structopt(short = "m", long = "mailservers")]
    mailservers: Vec<String>,
    /// length of time span from now
    #[structopt(short = "l", long = "duration", default_value = "24h", parse(try_from_str = humantime::parse_duration))]
    duration:    Duration,
    /// names of the channels
    #[structopt(short = "p", long = "channel", default_value = "status")]
    channels:    Vec<String>,
    /// how many of the (simulated) mailservers should lose their newest envelope
    #[structopt(long = "sim-lagging", default_value = "0")]
    sim_lagging: usize,
}


#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = Opts::from_args();
    init_logging(opts.common.verbosity);

    let config = opts.common.retrieval_config()?;
    let node_config = opts.common.node_config()?;
    let mail_servers = if opts.mailservers.is_empty() {
        pick_mail_servers(node_config.trusted_mail_servers(), &mut rand::thread_rng())
    } else {
        opts.mailservers.clone()
    };
    info!("checking {} mailserver(s): {mail_servers:?}", mail_servers.len());

    let session = SessionConfig::last(opts.duration, opts.channels.clone(), &config);
    let fleet = seeded_fleet(&mail_servers, &opts.channels, opts.common.sim_envelopes, session.time_range);
    for enode in mail_servers.iter().take(opts.sim_lagging) {
        fleet.forget_newest(enode, 1);
    }

    let cancellation = interrupt_token();
    let report = CrossCheck::new(Arc::new(fleet), node_config, config)
        .run(&mail_servers, session, &cancellation).await?;
    report.log_summary();
    std::process::exit(report.exit_code())
}
