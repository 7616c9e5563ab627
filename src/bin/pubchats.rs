//! Listens to public channels, counting their messages by chat & author, exposing the counters at `GET /metrics`.\
//! Runs until interrupted.

use mailserver_bots::prelude::*;
use std::{sync::Arc, time::Duration};
use log::info;
use rand::{seq::SliceRandom, Rng};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;


#[derive(Debug, StructOpt)]
#[structopt(name = "pubchats", about = "Counts the messages of public channels")]
struct Opts {
    #[structopt(flatten)]
    common:       CommonOpts,
    /// listener IP address
    #[structopt(short = "a", long = "addr", default_value = "127.0.0.1:30303")]
    addr:         String,
    /// public channels to track (besides the default ones)
    #[structopt(short = "c", long = "channel")]
    channels:     Vec<String>,
    /// metrics server listening address
    #[structopt(short = "m", long = "metrics-addr", default_value = "0.0.0.0:8080")]
    metrics_addr: String,
    /// how often someone talks on the (simulated) public channels
    #[structopt(long = "sim-interval", default_value = "1s", parse(try_from_str = humantime::parse_duration))]
    sim_interval: Duration,
}


#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = Opts::from_args();
    init_logging(opts.common.verbosity);

    let config = opts.common.retrieval_config()?;
    let mut node_config = opts.common.node_config()?;
    node_config.listen_addr = opts.addr.clone();
    let peers: Vec<String> = node_config.trusted_mail_servers().iter().map(|enode| enode.to_string()).collect();
    let channels = tracked_channels(&opts.channels);
    let fleet = Arc::new(SimulatedFleet::with_mail_servers(peers.iter().cloned()));

    let counter = Arc::new(LabeledCounter::messages_total());
    let metrics_server = MetricsServer::start(&opts.metrics_addr, Arc::clone(&counter)).await?;
    info!("serving metrics @ http://{}/metrics", metrics_server.local_addr());

    let cancellation = interrupt_token();
    let chatter = tokio::spawn(simulate_chatter(SimulatedFleet::clone(&fleet), channels.clone(), opts.sim_interval, cancellation.clone()));
    let listener = PublicChannelListener::new(fleet, node_config, config, channels, peers, counter);
    let result = listener.run(&cancellation).await;

    cancellation.cancel();
    let _ = chatter.await;
    metrics_server.shutdown().await;
    let received = result?;
    info!("{received} message(s) received");
    // being interrupted is the only way out
    std::process::exit(1)
}

/// Publishes a message, from a random author on a random channel, every `interval`
async fn simulate_chatter(fleet: SimulatedFleet, channels: Vec<String>, interval: Duration, cancellation: CancellationToken) {
    let authors: Vec<[u8; 8]> = (0..3).map(|_| rand::random()).collect();
    let mut ticker = tokio::time::interval(interval);
    for n in 0u64.. {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = ticker.tick() => {
                let (channel, author, timestamp) = {
                    let mut rng = rand::thread_rng();
                    (channels.choose(&mut rng).cloned(), authors.choose(&mut rng).copied(), unix_now() - rng.gen_range(0..5))
                };
                if let (Some(channel), Some(author)) = (channel, author) {
                    fleet.publish(&channel, timestamp, format!("hello #{n}").as_bytes(), &author);
                }
            },
        }
    }
}
