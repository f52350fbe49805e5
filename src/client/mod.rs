//! Channel Access client.
//!
//! [`ClientContext`] is the callback-level engine: channels, circuits,
//! discovery and the completion of requests, independent of any I/O. A
//! [`Transport`] moves its bytes; [`TokioTransport`] does that with tokio
//! sockets. [`Client`] wraps both behind async `get`/`put`/`subscribe`.

mod beacon;
mod channel;
mod circuit;
#[allow(clippy::module_inception)]
mod client;
mod completion;
mod context;
mod error;
mod io;
mod pool;
mod receivers;
mod searcher;
mod transport;

pub use channel::{ChannelInfo, ChannelState, ConnectionEvent, ConnectionHandler};
pub use circuit::{Circuit, CircuitState, Liveness};
pub use client::Client;
pub use completion::{OperationId, ReadCallback, SubscriptionCallback, WriteCallback};
pub use context::{ClientContext, WeakContext};
pub use error::ClientError;
pub use receivers::{SubscriberRecvError, SubscriberTryRecvError, Subscription};
pub use transport::{TokioTransport, Transport};
