//! Resting place for [SignalRouter], the fan-out dispatcher of the nodes' notifications

use crate::{
    error::RouterError,
    node::NotificationSender,
    signals::{
        correlator::{Dispatch, Reservation, RequestCorrelator, SignalFilter},
        notification::NodeSignal,
    },
    types::Hash,
};
use std::sync::{Arc, Mutex, PoisonError};
use log::{debug, error, trace};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;


/// Receives the raw notifications of every node (through the senders handed out by [Self::notification_sender()]),
/// decodes them & routes the mailserver request ones, by request id, to the single consumer registered for it
/// -- dropping them if there is none (see [RequestCorrelator] for the reservations exception).\
/// Constructed explicitly & passed by reference to whoever needs it: there is no process-wide instance.
pub struct SignalRouter {
    correlator: Arc<RequestCorrelator>,
    inlet:      NotificationSender,
    inbound:    Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown:   CancellationToken,
}

impl SignalRouter {

    pub fn new() -> Self {
        let (inlet, inbound) = mpsc::unbounded_channel();
        Self {
            correlator: RequestCorrelator::new(),
            inlet,
            inbound:    Mutex::new(Some(inbound)),
            shutdown:   CancellationToken::new(),
        }
    }

    /// The sender nodes should deliver their raw notifications to
    pub fn notification_sender(&self) -> NotificationSender {
        self.inlet.clone()
    }

    /// Spawns the consume loop, returning immediately.\
    /// The loop runs until [Self::shutdown()] is called (or `self` is dropped).
    pub fn start(&self) -> Result<JoinHandle<()>, RouterError> {
        let inbound = self.inbound.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RouterError::AlreadyStarted)?;
        let correlator = Arc::clone(&self.correlator);
        let shutdown = self.shutdown.clone();
        Ok(tokio::spawn(Self::consume(correlator, inbound, shutdown)))
    }

    /// Registers for the signals of `request_id` -- see [RequestCorrelator::register()].\
    /// Prefer [Self::reserve()] when issuing requests: a signal may arrive before this method is called.
    pub fn register(&self, request_id: Hash) -> Result<SignalFilter, RouterError> {
        self.correlator.register(request_id)
    }

    /// Takes the [Reservation] through which a request should be issued -- see [Reservation::issue()]
    pub fn reserve(&self) -> Reservation {
        self.correlator.reserve()
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// Stops the consume loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Decodes & routes a single raw notification
    pub fn dispatch_raw(correlator: &RequestCorrelator, raw: &str) -> Option<Dispatch> {
        trace!("`mailserver-bots::SignalRouter`: received signal: {raw}");
        match NodeSignal::decode(raw) {
            Ok(NodeSignal::Mail(signal)) => {
                let (kind, request_id) = (signal.kind(), signal.request_id());
                let dispatch = correlator.dispatch(signal);
                debug!("`mailserver-bots::SignalRouter`: '{kind}' signal for request {request_id}: {dispatch:?}");
                Some(dispatch)
            },
            Ok(NodeSignal::Other { kind }) => {
                debug!("`mailserver-bots::SignalRouter`: observed (unrouted) '{kind}' signal");
                None
            },
            Err(err) => {
                error!("`mailserver-bots::SignalRouter`: failed to decode signal envelope '{raw}': {err}");
                None
            },
        }
    }

    async fn consume(correlator: Arc<RequestCorrelator>, mut inbound: mpsc::UnboundedReceiver<String>, shutdown: CancellationToken) {
        loop {
            let raw = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                raw = inbound.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };
            Self::dispatch_raw(&correlator, &raw);
        }
        trace!("`mailserver-bots::SignalRouter`: consume loop ended");
    }
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}


/// Unit tests for our [router](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use crate::signals::notification::AsyncSignal;
    use std::time::Duration;


    fn id(n: u8) -> Hash {
        Hash([n; 32])
    }


    /// raw envelopes fed into the inlet come out, decoded, at the right consumer
    #[cfg_attr(not(doc),tokio::test)]
    async fn routes_raw_notifications() {
        let router = SignalRouter::new();
        let consume_loop = router.start().expect("starting the router");
        let mut filter = router.register(id(1)).expect("registering");
        let inlet = router.notification_sender();

        inlet.send(String::from("garbage")).expect("sending");
        inlet.send(NodeSignal::Other { kind: String::from("envelope.sent") }.encode()).expect("sending");
        inlet.send(NodeSignal::from(AsyncSignal::expired(id(2))).encode()).expect("sending");
        inlet.send(NodeSignal::from(AsyncSignal::completed(id(1), id(7))).encode()).expect("sending");

        let received = tokio::time::timeout(Duration::from_secs(5), filter.recv()).await
            .expect("timed out waiting for the routed signal");
        assert_eq!(received, Some(AsyncSignal::completed(id(1), id(7))), "garbage & foreign signals should have been skipped");

        router.shutdown();
        tokio::time::timeout(Duration::from_secs(5), consume_loop).await
            .expect("the consume loop didn't stop on shutdown")
            .expect("the consume loop panicked");
    }

    #[cfg_attr(not(doc),tokio::test)]
    async fn starts_only_once() {
        let router = SignalRouter::new();
        let _consume_loop = router.start().expect("starting the router");
        assert!(matches!(router.start(), Err(RouterError::AlreadyStarted)));
    }

    #[cfg_attr(not(doc),test)]
    fn dispatch_raw_reports_the_outcome() {
        let router = SignalRouter::new();
        let _filter = router.register(id(5)).expect("registering");
        let correlator = router.correlator();
        assert_eq!(SignalRouter::dispatch_raw(correlator, &NodeSignal::from(AsyncSignal::expired(id(5))).encode()), Some(Dispatch::Delivered));
        assert_eq!(SignalRouter::dispatch_raw(correlator, &NodeSignal::from(AsyncSignal::expired(id(6))).encode()), Some(Dispatch::Dropped));
        assert_eq!(SignalRouter::dispatch_raw(correlator, "{}"), None);
    }
}
