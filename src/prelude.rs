//! Re-exports of types useful for users of this crate

pub use crate::{
    types::{Hash, Topic, KeyId, TimeRange, ReceivedMessage, Criteria, MessagesRequest, unix_now},
    config::{RetrievalConfig, NodeConfig, FLEET_BETA, FLEET_STAGING, MAIN_NETWORK_ID},
    error::{NodeError, RouterError, WorkError, SetupStage, ConfigError},
    protocol::{public_chat_topic, MAIL_SERVER_PASSWORD},
    node::{NodeLauncher, MessagingNode, RpcClient, PeerEventKind, MessageStream, NotificationSender},
    node::simulated::{SimulatedFleet, MailServerBehavior},
    signals::{SignalRouter, SignalFilter, Reservation, AsyncSignal, NodeSignal},
    work::{RetrievalWorkUnit, SessionConfig, Retrieval},
    cross_check::{CrossCheck, CrossCheckReport, pick_mail_servers},
    bench::{LoadTest, LoadConfig, LoadTestReport},
    listener::{PublicChannelListener, tracked_channels},
    metrics::{LabeledCounter, MetricsServer},
    cli::{CommonOpts, Verbosity, init_logging, interrupt_token, seeded_fleet},
};
