//! Floods a mailserver with concurrent historic messages requests, reporting how many completed, expired or timed out.

use mailserver_bots::prelude::*;
use std::{sync::Arc, time::Duration};
use log::info;
use rand::seq::SliceRandom;
use structopt::StructOpt;


#[derive(Debug, StructOpt)]
#[structopt(name = "bench-mailserver", about = "Load tests a mailserver with concurrent historic messages requests")]
struct Opts {
    #[structopt(flatten)]
    common:      CommonOpts,
    /// listener IP address
    #[structopt(short = "a", long = "addr", default_value = "127.0.0.1:30303")]
    addr:        String,
    /// mail server address (by default a random one from the fleet is selected)
    #[structopt(short = "m", long = "mailserver")]
    mailserver:  Option<String>,
    /// number of concurrent requests
    #[structopt(short = "c", long = "concurrency", default_value = "5")]
    concurrency: usize,
    /// length of time span from now
    #[structopt(short = "l", long = "duration", default_value = "24h", parse(try_from_str = humantime::parse_duration))]
    duration:    Duration,
    /// name of the channel
    #[structopt(short = "p", long = "channel", default_value = "status")]
    channel:     String,
}


#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = Opts::from_args();
    init_logging(opts.common.verbosity);

    let config = opts.common.retrieval_config()?;
    let mut node_config = opts.common.node_config()?;
    node_config.listen_addr = opts.addr.clone();
    let mail_server = match &opts.mailserver {
        Some(mail_server) => mail_server.clone(),
        None => node_config.trusted_mail_servers()
                    .choose(&mut rand::thread_rng())
                    .map(|enode| enode.to_string())
                    .ok_or_else(|| format!("fleet '{}' has no mailservers", node_config.fleet))?,
    };
    info!("benchmarking {mail_server} with {} concurrent request(s)", opts.concurrency);

    let channels = [opts.channel.clone()];
    let range = TimeRange::up_to_now(opts.duration, config.upper_bound_margin);
    let fleet = seeded_fleet(&[mail_server.clone()], &channels, opts.common.sim_envelopes, range);

    let load = LoadConfig { channel: opts.channel.clone(), duration: opts.duration, concurrency: opts.concurrency };
    let report = LoadTest::new(Arc::new(fleet), mail_server, node_config, config)
        .run(&load, &interrupt_token()).await?;
    info!("completed: {}, expired: {}, timed out: {}, failed: {} -- {} message(s) received",
          report.completed, report.expired, report.timed_out, report.failed, report.received_messages);
    std::process::exit(report.exit_code())
}
