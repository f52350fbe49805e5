//! Per-request state correlating a server response with the call that asked for it.
//!
//! Reads, writes and subscriptions share one [`CompletionRecord`] shape and
//! differ only in their [`Notify`] tag. Records live in the context's
//! [`CompletionPool`](super::pool::CompletionPool) and are addressed by an
//! [`OperationId`].
//!
//! Callbacks are never run while engine locks are held. Work that produces a
//! result is turned into a [`Delivery`], collected, and invoked afterwards.

use std::{fmt, net::SocketAddr};

use crate::{
    client::{
        ClientError,
        channel::{ConnectionEvent, ConnectionHandler},
        io::IoToken,
        pool::{SizeClass, SlotHandle},
    },
    dbr::{Dbr, DbrCategory, DbrType},
    messages::MonitorMask,
};

pub type ReadCallback = Box<dyn FnOnce(Result<Dbr, ClientError>) + Send>;
pub type WriteCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send>;
pub type SubscriptionCallback = Box<dyn FnMut(Result<Dbr, ClientError>) + Send>;

/// Identifies an issued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(pub(crate) SlotHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Subscription,
}

impl OperationKind {
    pub fn size_class(&self) -> SizeClass {
        match self {
            OperationKind::Read | OperationKind::Write => SizeClass::Notify,
            OperationKind::Subscription => SizeClass::Subscription,
        }
    }
}

pub enum Notify {
    Read(ReadCallback),
    Write(WriteCallback),
    Subscription(SubscriptionCallback),
    /// No callback present. For a one-shot, its caller has already been
    /// answered and the record waits only so that a late reply can be
    /// recognised. For a subscription, the callback is out being invoked.
    Retired(OperationKind),
}

impl Notify {
    pub fn kind(&self) -> OperationKind {
        match self {
            Notify::Read(_) => OperationKind::Read,
            Notify::Write(_) => OperationKind::Write,
            Notify::Subscription(_) => OperationKind::Subscription,
            Notify::Retired(kind) => *kind,
        }
    }

    /// Wrap an error for delivery to whichever callback this is
    pub fn failure(self, handle: SlotHandle, error: ClientError) -> Option<Delivery> {
        match self {
            Notify::Read(callback) => Some(Delivery::Read(callback, Err(error))),
            Notify::Write(callback) => Some(Delivery::Write(callback, Err(error))),
            Notify::Subscription(callback) => Some(Delivery::Event(handle, callback, Err(error))),
            Notify::Retired(_) => None,
        }
    }
}

impl fmt::Debug for Notify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notify::Retired(kind) => write!(f, "Retired({kind:?})"),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

#[derive(Debug)]
pub struct CompletionRecord {
    /// Channel (client id) the operation was issued on
    pub channel: u32,
    pub category: DbrCategory,
    /// Requested element count; zero asks for the server's current length
    pub data_count: u32,
    /// Subscriptions only
    pub mask: MonitorMask,
    /// Type as sent on the wire, once it has been
    pub data_type: Option<DbrType>,
    /// Request id on the circuit it is currently in flight on
    pub request_id: Option<u32>,
    pub circuit: Option<SocketAddr>,
    /// Outstanding-IO token for one-shots
    pub token: Option<IoToken>,
    pub notify: Notify,
}

impl CompletionRecord {
    pub fn new(channel: u32, category: DbrCategory, data_count: u32, notify: Notify) -> Self {
        CompletionRecord {
            channel,
            category,
            data_count,
            mask: MonitorMask::default(),
            data_type: None,
            request_id: None,
            circuit: None,
            token: None,
            notify,
        }
    }
    pub fn kind(&self) -> OperationKind {
        self.notify.kind()
    }
    pub fn is_subscription(&self) -> bool {
        self.kind() == OperationKind::Subscription
    }
    pub fn is_retired(&self) -> bool {
        matches!(self.notify, Notify::Retired(_))
    }
    /// Swap the callback out, leaving the record retired
    pub fn retire(&mut self) -> Notify {
        let kind = self.kind();
        std::mem::replace(&mut self.notify, Notify::Retired(kind))
    }
    /// Forget where the request was sent
    pub fn detach(&mut self) {
        self.request_id = None;
        self.circuit = None;
    }
}

/// A callback ready to be invoked with its result
pub enum Delivery {
    Read(ReadCallback, Result<Dbr, ClientError>),
    Write(WriteCallback, Result<(), ClientError>),
    /// A subscription callback lent out of its record
    Event(SlotHandle, SubscriptionCallback, Result<Dbr, ClientError>),
    Connection(ConnectionHandler, ConnectionEvent),
}

impl Delivery {
    /// Run the callback. Subscription callbacks are handed back afterwards so
    /// they can be returned to their record.
    pub fn invoke(self) -> Option<(SlotHandle, SubscriptionCallback)> {
        match self {
            Delivery::Read(callback, result) => callback(result),
            Delivery::Write(callback, result) => callback(result),
            Delivery::Event(handle, mut callback, result) => {
                callback(result);
                return Some((handle, callback));
            }
            Delivery::Connection(handler, event) => handler(event),
        }
        None
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Read(_, result) => write!(f, "Read({:?})", result.as_ref().err()),
            Delivery::Write(_, result) => write!(f, "Write({:?})", result.as_ref().err()),
            Delivery::Event(handle, _, result) => {
                write!(f, "Event({handle:?}, {:?})", result.as_ref().err())
            }
            Delivery::Connection(_, event) => write!(f, "Connection({event:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::pool::CompletionPool;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn subscription_failure_hands_callback_back() {
        let pool = CompletionPool::new();
        let handle = pool.allocate(SizeClass::Subscription, ());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let notify = Notify::Subscription(Box::new(move |r| {
            assert!(matches!(r, Err(ClientError::Disconnected)));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let delivery = notify.failure(handle, ClientError::Disconnected).unwrap();
        let (returned, callback) = delivery.invoke().unwrap();
        assert_eq!(returned, handle);
        Notify::Subscription(callback)
            .failure(handle, ClientError::Disconnected)
            .unwrap()
            .invoke();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn read_failure_consumes_callback() {
        let pool = CompletionPool::new();
        let handle = pool.allocate(SizeClass::Notify, ());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut record = CompletionRecord::new(
            1,
            DbrCategory::Basic,
            1,
            Notify::Read(Box::new(move |r| {
                assert!(matches!(r, Err(ClientError::Cancelled)));
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let notify = record.retire();
        assert!(record.is_retired());
        assert_eq!(record.kind(), OperationKind::Read);
        assert!(notify
            .failure(handle, ClientError::Cancelled)
            .unwrap()
            .invoke()
            .is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Nothing left to call
        assert!(record.retire().failure(handle, ClientError::Cancelled).is_none());
    }
}
