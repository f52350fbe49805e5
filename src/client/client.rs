use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, debug_span, Instrument};

use crate::{
    client::{
        ClientError,
        channel::{ChannelInfo, ConnectionEvent, ConnectionHandler},
        completion::OperationId,
        context::ClientContext,
        receivers::Subscription,
        transport::TokioTransport,
    },
    config::ClientConfig,
    dbr::{Dbr, DbrCategory, DbrValue},
    messages::MonitorMask,
};

/// Updates buffered per subscription before slow receivers start to lag
const SUBSCRIPTION_CAPACITY: usize = 32;

/// A channel the client has asked for, by name
struct NamedChannel {
    cid: u32,
    connected: watch::Receiver<Option<ChannelInfo>>,
}

/// Cancels a subscription once every receiver for it is gone
pub(crate) struct SubscriptionGuard {
    context: ClientContext,
    operation: OperationId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.context.cancel_subscription(self.operation) {
            debug!("Subscription already gone on drop: {e}");
        }
    }
}

/// Async access to PVs by name.
///
/// Channels are created on first use and kept, so repeated reads of the same
/// PV reuse one connection.
pub struct Client {
    context: ClientContext,
    channels: Mutex<HashMap<String, Arc<NamedChannel>>>,
}

impl Client {
    /// Start a client configured from the environment
    pub async fn new() -> Result<Client, ClientError> {
        Self::with_config(ClientConfig::default()).await
    }

    pub async fn with_config(config: ClientConfig) -> Result<Client, ClientError> {
        let transport = Arc::new(TokioTransport::new(&config)?);
        let context = ClientContext::new(config, transport.clone());
        transport.start(&context).await?;
        Ok(Client {
            context,
            channels: Default::default(),
        })
    }

    /// The callback-level engine under this client
    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    fn named_channel(&self, name: &str) -> Result<Arc<NamedChannel>, ClientError> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }
        let (tx, rx) = watch::channel(None);
        let handler: ConnectionHandler = Arc::new(move |event| {
            let _ = tx.send(match event {
                ConnectionEvent::Connected(info) => Some(info),
                ConnectionEvent::Disconnected => None,
            });
        });
        let cid = self.context.create_channel(name, Some(handler))?;
        let channel = Arc::new(NamedChannel { cid, connected: rx });
        channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Wait until the named channel is connected
    pub async fn connect(&self, name: &str) -> Result<ChannelInfo, ClientError> {
        let channel = self.named_channel(name)?;
        let mut connected = channel.connected.clone();
        let timeout = self.context.config().connection_timeout;
        match tokio::time::timeout(timeout, connected.wait_for(Option::is_some)).await {
            Ok(Ok(info)) => info.clone().ok_or(ClientError::Disconnected),
            Ok(Err(_)) => Err(ClientError::ClientClosed),
            Err(_) => Err(ClientError::NotFound(name.to_string())),
        }
    }

    /// Stop using a channel. Subscriptions on it end.
    pub fn close_channel(&self, name: &str) -> Result<(), ClientError> {
        let channel = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        match channel {
            Some(channel) => self.context.destroy_channel(channel.cid),
            None => Err(ClientError::InvalidUsage(format!(
                "Channel '{name}' is not open"
            ))),
        }
    }

    /// Read a PV with the metadata of `category`
    pub async fn get_dbr(&self, name: &str, category: DbrCategory) -> Result<Dbr, ClientError> {
        let info = self.connect(name).await?;
        let (tx, rx) = oneshot::channel();
        self.context.read_notify(
            info.cid,
            category,
            0,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        let timeout = self.context.config().connection_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Read the value of a PV
    pub async fn read_pv(&self, name: &str) -> Result<DbrValue, ClientError> {
        self.get_dbr(name, DbrCategory::Time)
            .instrument(debug_span!("read_pv", name))
            .await
            .map(Dbr::take_value)
    }

    /// Read a PV converted to a Rust type. Arrays give their first element
    /// unless a `Vec` is asked for.
    pub async fn get<T>(&self, name: &str) -> Result<T, ClientError>
    where
        T: for<'a> TryFrom<&'a DbrValue>,
    {
        let value = self.read_pv(name).await?;
        T::try_from(&value).map_err(|_| ClientError::NoConvert)
    }

    /// Write a value, returning once the server has processed it
    pub async fn put(&self, name: &str, value: impl Into<DbrValue>) -> Result<(), ClientError> {
        let info = self.connect(name).await?;
        let (tx, rx) = oneshot::channel();
        self.context.write_notify(
            info.cid,
            value.into(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        let timeout = self.context.config().connection_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Subscribe to value and alarm changes of a PV.
    ///
    /// Updates carry timestamps. While the PV is disconnected the receiver
    /// sees [`ClientError::Disconnected`], and updates resume on reconnection.
    /// The subscription is cancelled when the last receiver is dropped.
    pub async fn subscribe<T>(&self, name: &str) -> Result<Subscription<T>, ClientError>
    where
        T: Clone + for<'a> TryFrom<&'a DbrValue>,
    {
        let info = self.connect(name).await?;
        let (tx, rx) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        let operation = self.context.subscribe(
            info.cid,
            DbrCategory::Time,
            0,
            MonitorMask::default(),
            Box::new(move |update| {
                let _ = tx.send(update);
            }),
        )?;
        debug!("Subscribed to '{name}'");
        Ok(Subscription::new(
            rx,
            Arc::new(SubscriptionGuard {
                context: self.context.clone(),
                operation,
            }),
        ))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.context.shutdown();
    }
}
