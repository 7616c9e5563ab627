//! Correlation of the nodes' asynchronous notifications ("signals") with the requests that caused them.
//!
//! Nodes deliver raw JSON notifications to the [SignalRouter], which decodes them into [NodeSignal]s and routes
//! the mailserver request ones to the [SignalFilter] registered for their request id:
//! ```nocompile
//!     let router = SignalRouter::new();
//!     router.start()?;
//!     let node = launcher.start_node(&config, router.notification_sender()).await?;
//!     ...
//!     let mut signals = router.reserve().issue(async { rpc.request_messages(request).await }).await?;
//!     while let Some(signal) = signals.recv().await { ... }
//! ```

pub mod correlator;
pub mod notification;
pub mod router;

pub use correlator::{Dispatch, RequestCorrelator, Reservation, SignalFilter};
pub use notification::{AsyncSignal, MailSignalKind, NodeSignal};
pub use router::SignalRouter;
