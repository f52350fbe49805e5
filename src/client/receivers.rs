use std::{marker::PhantomData, sync::Arc};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    client::{ClientError, client::SubscriptionGuard},
    dbr::{Dbr, DbrValue},
};

type Update = Result<Dbr, ClientError>;

/// Error from [`Subscription::recv`]
#[derive(Debug, Error)]
pub enum SubscriberRecvError {
    #[error("Channel closed")]
    Closed,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
    #[error("Could not convert Dbr to type")]
    NoConvert(Box<Dbr>),
    #[error("{0}")]
    Client(#[from] ClientError),
}

impl From<broadcast::error::RecvError> for SubscriberRecvError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => Self::Closed,
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Error from [`Subscription::try_recv`]
#[derive(Debug, Error)]
pub enum SubscriberTryRecvError {
    #[error("No messages outstanding")]
    Empty,
    #[error("Channel closed")]
    Closed,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
    #[error("Could not convert Dbr to type")]
    NoConvert(Box<Dbr>),
    #[error("{0}")]
    Client(#[from] ClientError),
}

impl From<broadcast::error::TryRecvError> for SubscriberTryRecvError {
    fn from(err: broadcast::error::TryRecvError) -> Self {
        match err {
            broadcast::error::TryRecvError::Empty => Self::Empty,
            broadcast::error::TryRecvError::Closed => Self::Closed,
            broadcast::error::TryRecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Typed updates from a subscription.
///
/// Wraps a `tokio::sync::broadcast::Receiver`; clones made with
/// [`Subscription::resubscribe`] share the one subscription on the server,
/// which is cancelled when the last of them is dropped.
pub struct Subscription<T>
where
    T: Clone + for<'a> TryFrom<&'a DbrValue>,
{
    inner: broadcast::Receiver<Update>,
    _guard: Arc<SubscriptionGuard>,
    _phantom: PhantomData<T>,
}

impl<T> Subscription<T>
where
    T: Clone + for<'a> TryFrom<&'a DbrValue>,
{
    pub(crate) fn new(inner: broadcast::Receiver<Update>, guard: Arc<SubscriptionGuard>) -> Self {
        Self {
            inner,
            _guard: guard,
            _phantom: PhantomData,
        }
    }

    fn convert(dbr: Dbr) -> Result<T, Box<Dbr>> {
        match dbr.value().try_into().ok() {
            Some(v) => Ok(v),
            None => Err(Box::new(dbr)),
        }
    }

    /// Blocking receive for synchronous contexts
    pub fn blocking_recv(&mut self) -> Result<T, SubscriberRecvError> {
        let dbr = self.inner.blocking_recv()??;
        Self::convert(dbr).map_err(SubscriberRecvError::NoConvert)
    }

    /// Receive the next value
    pub async fn recv(&mut self) -> Result<T, SubscriberRecvError> {
        let dbr = self.recv_dbr().await?;
        Self::convert(dbr).map_err(SubscriberRecvError::NoConvert)
    }

    /// Receive the next update with its metadata
    pub async fn recv_dbr(&mut self) -> Result<Dbr, SubscriberRecvError> {
        Ok(self.inner.recv().await??)
    }

    /// Try to receive a value without waiting
    pub fn try_recv(&mut self) -> Result<T, SubscriberTryRecvError> {
        let dbr = self.inner.try_recv()??;
        Self::convert(dbr).map_err(SubscriberTryRecvError::NoConvert)
    }

    /// True if the subscription has ended
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of updates waiting
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Another receiver for the same subscription, starting from now
    pub fn resubscribe(&self) -> Self {
        Self {
            inner: self.inner.resubscribe(),
            _guard: self._guard.clone(),
            _phantom: PhantomData,
        }
    }

    /// Returns true if two receivers belong to the same subscription
    pub fn same_channel(&self, other: &Self) -> bool {
        self.inner.same_channel(&other.inner)
    }
}
