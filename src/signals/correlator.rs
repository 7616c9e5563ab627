//! The request correlation table behind [super::SignalRouter]: maps request identifiers to private
//! delivery channels, created on demand and torn down by their owners.
//!
//! Two kinds of entries live here, both guarded by the same mutex:
//!   * registrations -- at most one per request id, each owned by a [SignalFilter] which removes it (exactly once) when cancelled or dropped;
//!   * reservations -- taken, through [RequestCorrelator::reserve()], *before* the request RPC is issued. While any reservation is
//!     outstanding, signals for not-yet-registered request ids are retained so they may be replayed when the reservation learns
//!     its request id -- closing the window between "the RPC returned a request id" and "the consumer registered for it".

use crate::{
    error::RouterError,
    signals::notification::AsyncSignal,
    types::Hash,
};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use log::{trace, warn};
use tokio::sync::mpsc;


/// How many unmatched signals each outstanding [Reservation] retains
pub const RESERVATION_BACKLOG: usize = 64;


/// What happened to a dispatched signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// sent to the consumer registered for its request id
    Delivered,
    /// no consumer registered, but retained by this many outstanding reservations
    Retained(usize),
    /// no consumer & no reservations -- at-most-once delivery: nobody will ever see it
    Dropped,
}

/// The (mutex-guarded) table of registrations & reservations
#[derive(Default)]
pub struct RequestCorrelator {
    table: Mutex<CorrelationTable>,
}

#[derive(Default)]
struct CorrelationTable {
    /// request id -> (serial, delivery channel)
    registrations: HashMap<Hash, (u64, mpsc::UnboundedSender<AsyncSignal>)>,
    /// reservation serial -> retained signals
    reservations:  HashMap<u64, VecDeque<AsyncSignal>>,
    next_serial:   u64,
}

impl CorrelationTable {
    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }
}

impl RequestCorrelator {

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Installs a fresh delivery channel for `request_id`, returning the [SignalFilter] owning it.\
    /// Fails with [RouterError::DuplicateRegistration] if a live registration already exists for the same id:
    /// previous registrations are never overwritten.
    pub fn register(self: &Arc<Self>, request_id: Hash) -> Result<SignalFilter, RouterError> {
        let mut table = self.lock();
        Self::register_locked(self, &mut table, request_id, VecDeque::new())
    }

    /// Takes a [Reservation], to be turned into a [SignalFilter] by [Reservation::issue()]
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        let mut table = self.lock();
        let serial = table.next_serial();
        table.reservations.insert(serial, VecDeque::new());
        Reservation { serial, correlator: Arc::clone(self), consumed: false }
    }

    /// Routes `signal` to the consumer registered under its request id -- never blocking
    pub fn dispatch(&self, signal: AsyncSignal) -> Dispatch {
        let request_id = signal.request_id();
        let mut table = self.lock();
        if let Some((_serial, sender)) = table.registrations.get(&request_id) {
            if sender.send(signal).is_err() {
                // the filter is being dropped right now and will remove its entry
                trace!("`mailserver-bots::RequestCorrelator`: consumer for request {request_id} is gone -- signal discarded");
                return Dispatch::Dropped
            }
            return Dispatch::Delivered
        }
        if table.reservations.is_empty() {
            return Dispatch::Dropped
        }
        let retainers = table.reservations.len();
        for backlog in table.reservations.values_mut() {
            if backlog.len() >= RESERVATION_BACKLOG {
                backlog.pop_front();
            }
            backlog.push_back(signal.clone());
        }
        Dispatch::Retained(retainers)
    }

    pub fn is_registered(&self, request_id: &Hash) -> bool {
        self.lock().registrations.contains_key(request_id)
    }

    /// Number of live registrations
    pub fn registrations(&self) -> usize {
        self.lock().registrations.len()
    }

    /// Number of outstanding reservations
    pub fn reservations(&self) -> usize {
        self.lock().reservations.len()
    }

    fn register_locked(self: &Arc<Self>, table: &mut CorrelationTable, request_id: Hash, backlog: VecDeque<AsyncSignal>) -> Result<SignalFilter, RouterError> {
        if table.registrations.contains_key(&request_id) {
            warn!("`mailserver-bots::RequestCorrelator`: BUG? request {request_id} registered twice -- refusing the second registration");
            return Err(RouterError::DuplicateRegistration(request_id))
        }
        let serial = table.next_serial();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut replayed = 0;
        for signal in backlog.into_iter().filter(|signal| signal.request_id() == request_id) {
            // the receiver is right here, so this can't fail
            let _ = sender.send(signal);
            replayed += 1;
        }
        if replayed > 0 {
            trace!("`mailserver-bots::RequestCorrelator`: replayed {replayed} early signal(s) for request {request_id}");
        }
        table.registrations.insert(request_id, (serial, sender));
        Ok(SignalFilter { request_id, serial, receiver, correlator: Arc::clone(self) })
    }

    /// Removes the registration -- only if it is still the one identified by `serial`
    fn unregister(&self, request_id: &Hash, serial: u64) {
        let mut table = self.lock();
        if matches!(table.registrations.get(request_id), Some((registered_serial, _)) if *registered_serial == serial) {
            table.registrations.remove(request_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CorrelationTable> {
        // the table stays consistent even if a holder panicked: every mutation is a single map operation
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


/// The receiving end of a registration: yields the signals for [Self::request_id()].\
/// Cancelling (explicitly, through [Self::cancel()], or by dropping) removes the registration & closes the channel.
#[derive(Debug)]
pub struct SignalFilter {
    request_id: Hash,
    serial:     u64,
    receiver:   mpsc::UnboundedReceiver<AsyncSignal>,
    correlator: Arc<RequestCorrelator>,
}

impl SignalFilter {

    pub fn request_id(&self) -> Hash {
        self.request_id
    }

    /// Waits for the next signal -- `None` only after the registration was cancelled
    pub async fn recv(&mut self) -> Option<AsyncSignal> {
        self.receiver.recv().await
    }

    /// Non-blocking version of [Self::recv()]
    pub fn try_recv(&mut self) -> Option<AsyncSignal> {
        self.receiver.try_recv().ok()
    }

    /// Removes the registration & closes the delivery channel
    pub fn cancel(self) {
        drop(self)
    }
}

impl Drop for SignalFilter {
    fn drop(&mut self) {
        self.receiver.close();
        self.correlator.unregister(&self.request_id, self.serial);
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        write!(f, "RequestCorrelator {{registrations: {}, reservations: {}}}", table.registrations.len(), table.reservations.len())
    }
}


/// A token that must be taken *before* issuing the request RPC -- the only way to be sure no signal for the request is lost.\
/// See [Self::issue()].
#[derive(Debug)]
pub struct Reservation {
    serial:     u64,
    correlator: Arc<RequestCorrelator>,
    consumed:   bool,
}

impl Reservation {

    /// Awaits the `request` future (which should issue the RPC and return its request id) and registers for the returned id,
    /// replaying any signal for it that arrived in between.\
    /// If `request` fails, the reservation is released and its error returned.
    pub async fn issue<RequestFuture, ErrorType>(self, request: RequestFuture) -> Result<SignalFilter, ErrorType>
                                                where RequestFuture: Future<Output=Result<Hash, ErrorType>>,
                                                      ErrorType:     From<RouterError> {
        let request_id = request.await?;
        self.bind(request_id)
            .map_err(ErrorType::from)
    }

    /// Turns this reservation into the registration for `request_id`
    pub fn bind(mut self, request_id: Hash) -> Result<SignalFilter, RouterError> {
        self.consumed = true;
        let correlator = Arc::clone(&self.correlator);
        let mut table = correlator.lock();
        let backlog = table.reservations.remove(&self.serial).unwrap_or_default();
        RequestCorrelator::register_locked(&correlator, &mut table, request_id, backlog)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.consumed {
            self.correlator.lock().reservations.remove(&self.serial);
        }
    }
}


/// Unit tests for our [correlator](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;


    fn id(n: u8) -> Hash {
        Hash([n; 32])
    }


    /// signals reach only the consumer registered under their request id
    #[cfg_attr(not(doc),tokio::test)]
    async fn routes_by_request_id() {
        let correlator = RequestCorrelator::new();
        let mut one = correlator.register(id(1)).expect("registering 1");
        let mut two = correlator.register(id(2)).expect("registering 2");

        assert_eq!(correlator.dispatch(AsyncSignal::expired(id(2))), Dispatch::Delivered);
        assert_eq!(correlator.dispatch(AsyncSignal::completed(id(1), id(9))), Dispatch::Delivered);

        assert_eq!(one.recv().await, Some(AsyncSignal::completed(id(1), id(9))));
        assert_eq!(two.recv().await, Some(AsyncSignal::expired(id(2))));
        assert_eq!(one.try_recv(), None, "consumer 1 got a signal that wasn't its own");
        assert_eq!(two.try_recv(), None, "consumer 2 got a signal that wasn't its own");
    }

    /// dispatching to an unregistered id is a no-op -- neither blocking nor panicking
    #[cfg_attr(not(doc),test)]
    fn unregistered_is_dropped() {
        let correlator = RequestCorrelator::new();
        assert_eq!(correlator.dispatch(AsyncSignal::expired(id(3))), Dispatch::Dropped);
        let filter = correlator.register(id(3)).expect("registering 3");
        filter.cancel();
        assert_eq!(correlator.dispatch(AsyncSignal::expired(id(3))), Dispatch::Dropped, "cancelled registrations must not receive anything");
        assert_eq!(correlator.registrations(), 0);
    }

    /// a consumer closing its end (while its registration is still being removed) doesn't get signals counted as delivered
    #[cfg_attr(not(doc),test)]
    fn closed_consumers_are_dropped() {
        let correlator = RequestCorrelator::new();
        let mut filter = correlator.register(id(7)).expect("registering 7");
        filter.receiver.close();
        assert_eq!(correlator.registrations(), 1, "the registration is only removed once the filter is dropped");
        assert_eq!(correlator.dispatch(AsyncSignal::expired(id(7))), Dispatch::Dropped);
        drop(filter);
        assert_eq!(correlator.registrations(), 0);
    }

    /// a second live registration for the same id is refused -- and doesn't disturb the first one
    #[cfg_attr(not(doc),tokio::test)]
    async fn duplicate_registration_is_rejected() {
        let correlator = RequestCorrelator::new();
        let mut first = correlator.register(id(4)).expect("first registration");
        let second = correlator.register(id(4));
        assert!(matches!(second, Err(RouterError::DuplicateRegistration(rejected)) if rejected == id(4)), "{second:?}");

        correlator.dispatch(AsyncSignal::expired(id(4)));
        assert_eq!(first.recv().await, Some(AsyncSignal::expired(id(4))), "the first registration must still be in place");

        // once cancelled, the id may be registered again
        first.cancel();
        assert!(correlator.register(id(4)).is_ok(), "re-registering after cancellation should be allowed");
    }

    /// interleaved register / cancel / dispatch across ids keeps every signal with its owner
    #[cfg_attr(not(doc),tokio::test)]
    async fn interleaved_operations() {
        let correlator = RequestCorrelator::new();
        let mut filters: Vec<SignalFilter> = (0..8).map(|n| correlator.register(id(n)).expect("registering")).collect();
        // cancel the odd ones
        let mut evens: Vec<SignalFilter> = filters.drain(..).filter(|filter| filter.request_id().0[0] % 2 == 0).collect();
        for n in 0..8 {
            let expected = if n % 2 == 0 { Dispatch::Delivered } else { Dispatch::Dropped };
            assert_eq!(correlator.dispatch(AsyncSignal::completed(id(n), id(100+n))), expected, "dispatching to {n}");
        }
        for filter in evens.iter_mut() {
            let n = filter.request_id().0[0];
            assert_eq!(filter.recv().await, Some(AsyncSignal::completed(id(n), id(100+n))));
            assert_eq!(filter.try_recv(), None);
        }
        assert_eq!(correlator.registrations(), 4);
        drop(evens);
        assert_eq!(correlator.registrations(), 0, "dropping filters must release their registrations");
    }

    /// a signal arriving between "the RPC returned" and "the consumer registered" is replayed to the right consumer only
    #[cfg_attr(not(doc),tokio::test)]
    async fn reservation_replays_early_signals() {
        let correlator = RequestCorrelator::new();
        let reservation_a = correlator.reserve();
        let reservation_b = correlator.reserve();

        // both requests got answered before their issuers could register
        assert_eq!(correlator.dispatch(AsyncSignal::completed(id(10), id(11))), Dispatch::Retained(2));
        assert_eq!(correlator.dispatch(AsyncSignal::expired(id(20))),           Dispatch::Retained(2));

        let mut filter_a = reservation_a.issue(async { Ok::<_, RouterError>(id(10)) }).await.expect("issuing a");
        let mut filter_b = reservation_b.bind(id(20)).expect("binding b");
        assert_eq!(filter_a.recv().await, Some(AsyncSignal::completed(id(10), id(11))));
        assert_eq!(filter_a.try_recv(), None, "a got b's signal");
        assert_eq!(filter_b.recv().await, Some(AsyncSignal::expired(id(20))));
        assert_eq!(filter_b.try_recv(), None, "b got a's signal");
        assert_eq!(correlator.reservations(), 0, "bound reservations must be released");
    }

    /// failed requests release their reservations
    #[cfg_attr(not(doc),tokio::test)]
    async fn failed_issue_releases_the_reservation() {
        let correlator = RequestCorrelator::new();
        let reservation = correlator.reserve();
        let result = reservation.issue(async { Err::<Hash, RouterError>(RouterError::AlreadyStarted) }).await;
        assert!(result.is_err());
        assert_eq!(correlator.reservations(), 0);
        assert_eq!(correlator.dispatch(AsyncSignal::expired(id(1))), Dispatch::Dropped, "nothing should be retained without reservations");
    }

    /// retained backlogs are bounded
    #[cfg_attr(not(doc),test)]
    fn reservation_backlog_is_bounded() {
        let correlator = RequestCorrelator::new();
        let reservation = correlator.reserve();
        for n in 0..(RESERVATION_BACKLOG + 10) {
            correlator.dispatch(AsyncSignal::expired(id((n % 200) as u8)));
        }
        // id(0) was dispatched first, so it was pushed out of the backlog
        let mut filter = reservation.bind(id(0)).expect("binding");
        assert_eq!(filter.try_recv(), None, "the oldest retained signals should have been evicted");
    }
}
