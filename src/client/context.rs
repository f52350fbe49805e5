//! The client context: registry of channels and circuits, and the dispatcher
//! for everything servers send back.
//!
//! The context itself never touches a socket. A [`Transport`] owns the
//! sockets and calls back into the context for every datagram, message,
//! connection and failure; the context queues outgoing bytes on the
//! [`Circuit`] and asks the transport to connect or search.
//!
//! Locks are always taken in the order callback lock, registry, circuit,
//! then the leaf locks (discovery, beacons, pool, io). User callbacks run
//! while the callback lock is held but no other, so a callback may call back
//! into the context, and once `destroy_channel` or `cancel_subscription`
//! returns no callback for that operation can still be running or start.

use std::{
    cell::Cell,
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    client::{
        ClientError,
        beacon::{BeaconTracker, BeaconVerdict},
        channel::{Channel, ChannelInfo, ChannelState, ConnectionEvent, ConnectionHandler},
        circuit::{Circuit, Liveness},
        completion::{
            CompletionRecord, Delivery, Notify, OperationId, OperationKind, ReadCallback,
            SubscriptionCallback, WriteCallback,
        },
        io::IoAccounting,
        pool::{CompletionPool, SizeClass, SlotHandle},
        searcher::Discovery,
        transport::Transport,
    },
    config::ClientConfig,
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue},
    messages::{
        Access, CLIENT_MINOR_VERSION, ClearChannel, ClientMessage, CreateChannel,
        CreateChannelResponse, ECAError, ECA_NORMAL, ErrorCondition, EventAdd,
        EventAddResponse, EventCancel, Message, MonitorMask, ReadNotify, Write, WriteNotify,
        command,
    },
    utils::IdAllocator,
};

/// Servers older than this do not understand a zero count as "all elements"
const DYNAMIC_ARRAY_MINOR_VERSION: u16 = 13;

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the context whose callbacks this thread is running, or 0
    static IN_CALLBACK: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running callbacks until dropped
struct CallbackScope {
    previous: usize,
}

impl CallbackScope {
    fn enter(id: usize) -> Self {
        CallbackScope {
            previous: IN_CALLBACK.with(|c| c.replace(id)),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|c| c.set(self.previous));
    }
}

/// Holds the callback lock, unless this thread already does
struct CallbackGuard<'a> {
    _lock: Option<MutexGuard<'a, ()>>,
}

struct Registry {
    channels: HashMap<u32, Channel>,
    circuits: HashMap<SocketAddr, Arc<Circuit>>,
    channel_ids: IdAllocator,
}

/// What a one-shot request needs to know about a claimed channel
struct Target {
    circuit: Arc<Circuit>,
    server_id: u32,
    native_type: DbrBasicType,
    native_count: u32,
    access: Access,
}

enum Request {
    Read { category: DbrCategory, count: u32 },
    Write(DbrValue),
}

enum Reply {
    Read(Result<Dbr, ClientError>),
    Write(Result<(), ClientError>),
}

struct ContextInner {
    id: usize,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    callback_lock: Mutex<()>,
    registry: Mutex<Registry>,
    discovery: Mutex<Discovery>,
    beacons: Mutex<BeaconTracker>,
    io: IoAccounting,
    pool: CompletionPool<CompletionRecord>,
    closed: AtomicBool,
}

/// Owns every channel and circuit of one client session
#[derive(Clone)]
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

/// A reference to a context that does not keep it alive
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<ClientContext> {
        self.inner.upgrade().map(|inner| ClientContext { inner })
    }
}

/// Interpret the status code of a reply
fn status_result(status_code: u32) -> Result<(), ClientError> {
    if status_code == ECA_NORMAL {
        return Ok(());
    }
    match ErrorCondition::from_status(status_code) {
        Some(condition) if condition.is_success() => Ok(()),
        Some(condition) => Err(condition.into()),
        None => Err(ClientError::Malformed(format!(
            "Unknown status code {status_code:#x}"
        ))),
    }
}

/// Element count to put on the wire for a request
fn request_count(requested: u32, native_count: u32, version: u16) -> u32 {
    if requested == 0 && version < DYNAMIC_ARRAY_MINOR_VERSION {
        native_count
    } else {
        requested
    }
}

fn no_such_channel(cid: u32) -> ClientError {
    ClientError::InvalidUsage(format!("No channel with id {cid}"))
}

impl ClientContext {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        ClientContext {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                discovery: Mutex::new(Discovery::new(
                    config.min_search_period,
                    config.max_search_period,
                    config.max_datagram_size,
                )),
                beacons: Mutex::new(BeaconTracker::new(config.beacon_table_capacity, now)),
                config,
                transport,
                callback_lock: Mutex::new(()),
                registry: Mutex::new(Registry {
                    channels: HashMap::new(),
                    circuits: HashMap::new(),
                    channel_ids: IdAllocator::starting_at(1),
                }),
                io: IoAccounting::new(),
                pool: CompletionPool::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::ClientClosed)
        } else {
            Ok(())
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discovery(&self) -> MutexGuard<'_, Discovery> {
        self.inner.discovery.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn beacons(&self) -> MutexGuard<'_, BeaconTracker> {
        self.inner.beacons.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_callback(&self) -> bool {
        IN_CALLBACK.with(|c| c.get()) == self.inner.id
    }

    fn callback_guard(&self) -> CallbackGuard<'_> {
        if self.in_callback() {
            CallbackGuard { _lock: None }
        } else {
            CallbackGuard {
                _lock: Some(
                    self.inner
                        .callback_lock
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()),
                ),
            }
        }
    }

    /// Run collected callbacks. Must be called with the callback guard held
    /// and no other lock.
    fn deliver(&self, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }
        let _scope = CallbackScope::enter(self.inner.id);
        for delivery in deliveries {
            trace!("Delivering {delivery:?}");
            if let Some((handle, callback)) = delivery.invoke() {
                self.return_callback(handle, callback);
            }
        }
    }

    /// Put a lent subscription callback back, unless the subscription ended
    /// while it was out.
    fn return_callback(&self, handle: SlotHandle, callback: SubscriptionCallback) {
        self.inner.pool.with(handle, move |record| {
            if matches!(record.notify, Notify::Retired(OperationKind::Subscription)) {
                record.notify = Notify::Subscription(callback);
            }
        });
    }

    fn is_current(registry: &Registry, circuit: &Arc<Circuit>) -> bool {
        registry
            .circuits
            .get(&circuit.address())
            .is_some_and(|c| Arc::ptr_eq(c, circuit))
    }

    /// Create a channel and start searching for it.
    ///
    /// `on_connect` is told each time the channel is claimed or loses its
    /// server.
    pub fn create_channel(
        &self,
        name: &str,
        on_connect: Option<ConnectionHandler>,
    ) -> Result<u32, ClientError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(ClientError::InvalidUsage(
                "Channel name may not be empty".to_string(),
            ));
        }
        let cid = {
            let mut registry = self.registry();
            let Registry {
                channels,
                channel_ids,
                ..
            } = &mut *registry;
            let cid = channel_ids.allocate(|id| channels.contains_key(&id));
            channels.insert(cid, Channel::new(name, cid, on_connect));
            self.discovery().install(cid, name, Instant::now());
            cid
        };
        self.inner.transport.wake_search();
        Ok(cid)
    }

    /// Destroy a channel. Its outstanding operations, subscriptions
    /// included, complete with [`ClientError::Cancelled`] before this returns.
    pub fn destroy_channel(&self, cid: u32) -> Result<(), ClientError> {
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        let result = {
            let mut registry = self.registry();
            self.destroy_locked(&mut registry, cid, &mut out)
        };
        self.deliver(out);
        result
    }

    fn destroy_locked(
        &self,
        registry: &mut Registry,
        cid: u32,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ClientError> {
        let Some(mut channel) = registry.channels.remove(&cid) else {
            return Err(no_such_channel(cid));
        };
        let _span = debug_span!("destroy_channel", cid).entered();
        self.discovery().remove(cid);
        let circuit = channel
            .circuit()
            .and_then(|address| registry.circuits.get(&address).cloned());
        let server_id = channel.server_id();
        let mut messages: Vec<Message> = Vec::new();

        for handle in channel.take_operations() {
            let Some(mut record) = self.inner.pool.release(handle) else {
                continue;
            };
            if let (Some(circuit), Some(ioid)) = (&circuit, record.request_id) {
                circuit.complete(ioid);
                if record.is_subscription() {
                    if let (Some(server_id), Some(data_type)) = (server_id, record.data_type) {
                        messages.push(
                            EventCancel {
                                data_type,
                                data_count: record.data_count,
                                server_id,
                                subscription_id: ioid,
                            }
                            .into(),
                        );
                    }
                }
            }
            if let Some(token) = record.token {
                self.inner.io.end(token);
            }
            out.extend(record.retire().failure(handle, ClientError::Cancelled));
        }

        if let Some(circuit) = circuit {
            if let (ChannelState::Claimed, Some(server_id)) = (channel.state(), server_id) {
                messages.push(
                    ClearChannel {
                        server_id,
                        client_id: cid,
                    }
                    .into(),
                );
            }
            for message in messages {
                if self
                    .send_or_teardown(registry, &circuit, message, out)
                    .is_err()
                {
                    break;
                }
            }
            if circuit.unclaim(cid) {
                self.close_circuit(registry, &circuit);
            }
        }
        channel.destroyed();
        Ok(())
    }

    pub fn channel_state(&self, cid: u32) -> Option<ChannelState> {
        self.registry().channels.get(&cid).map(|c| c.state())
    }

    /// Details of a claimed channel
    pub fn channel_info(&self, cid: u32) -> Option<ChannelInfo> {
        self.registry().channels.get(&cid)?.info()
    }

    pub fn channel_count(&self) -> usize {
        self.registry().channels.len()
    }

    pub fn circuit_count(&self) -> usize {
        self.registry().circuits.len()
    }

    /// Number of reads and notified writes not yet completed
    pub fn pending_io(&self) -> u64 {
        self.inner.io.outstanding()
    }

    fn target(registry: &Registry, cid: u32) -> Result<Target, ClientError> {
        let channel = registry
            .channels
            .get(&cid)
            .ok_or_else(|| no_such_channel(cid))?;
        if channel.state() != ChannelState::Claimed {
            return Err(ClientError::Disconnected);
        }
        let circuit = channel
            .circuit()
            .and_then(|address| registry.circuits.get(&address))
            .cloned()
            .ok_or(ClientError::Disconnected)?;
        Ok(Target {
            circuit,
            server_id: channel.server_id().ok_or(ClientError::Disconnected)?,
            native_type: channel.native_type().ok_or(ClientError::Disconnected)?,
            native_count: channel.native_count(),
            access: channel.access(),
        })
    }

    /// Read the value of a channel once, in its native type with the
    /// metadata of `category`. A `count` of zero asks for every element.
    pub fn read_notify(
        &self,
        cid: u32,
        category: DbrCategory,
        count: u32,
        callback: ReadCallback,
    ) -> Result<OperationId, ClientError> {
        self.issue(cid, Request::Read { category, count }, Notify::Read(callback))
    }

    /// Write a value, with a completion once the server has processed it
    pub fn write_notify(
        &self,
        cid: u32,
        value: DbrValue,
        callback: WriteCallback,
    ) -> Result<OperationId, ClientError> {
        self.issue(cid, Request::Write(value), Notify::Write(callback))
    }

    fn issue(
        &self,
        cid: u32,
        request: Request,
        notify: Notify,
    ) -> Result<OperationId, ClientError> {
        self.ensure_open()?;
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        let result = {
            let mut registry = self.registry();
            self.issue_locked(&mut registry, cid, request, notify, &mut out)
        };
        self.deliver(out);
        result
    }

    fn issue_locked(
        &self,
        registry: &mut Registry,
        cid: u32,
        request: Request,
        notify: Notify,
        out: &mut Vec<Delivery>,
    ) -> Result<OperationId, ClientError> {
        let target = Self::target(registry, cid)?;
        let circuit = &target.circuit;
        let (category, requested, data_type, payload) = match request {
            Request::Read { category, count } => {
                if !target.access.can_read() {
                    return Err(ClientError::AccessDenied);
                }
                if count > target.native_count {
                    return Err(ClientError::InvalidUsage(format!(
                        "Requested {count} elements of a {} element channel",
                        target.native_count
                    )));
                }
                let data_count = request_count(count, target.native_count, circuit.effective_version());
                (
                    category,
                    data_count,
                    DbrType::new(target.native_type, category),
                    None,
                )
            }
            Request::Write(value) => {
                if !target.access.can_write() {
                    return Err(ClientError::AccessDenied);
                }
                let (count, data) = value.to_bytes(None);
                if count == 0 || count as u32 > target.native_count {
                    return Err(ClientError::InvalidUsage(format!(
                        "Cannot write {count} elements to a {} element channel",
                        target.native_count
                    )));
                }
                (
                    DbrCategory::Basic,
                    count as u32,
                    DbrType::new(value.get_type(), DbrCategory::Basic),
                    Some(data),
                )
            }
        };

        let token = self.inner.io.begin();
        let mut record = CompletionRecord::new(cid, category, requested, notify);
        record.token = Some(token);
        record.data_type = Some(data_type);
        record.circuit = Some(circuit.address());
        let handle = self.inner.pool.allocate(SizeClass::Notify, record);
        let ioid = circuit.register(handle);
        self.inner.pool.with(handle, |r| r.request_id = Some(ioid));

        let message: Message = match payload {
            None => ReadNotify {
                data_type,
                data_count: requested,
                server_id: target.server_id,
                client_ioid: ioid,
            }
            .into(),
            Some(data) => WriteNotify {
                data_type,
                data_count: requested,
                server_id: target.server_id,
                client_ioid: ioid,
                data,
            }
            .into(),
        };
        if let Err(e) = circuit.send(message) {
            // The request never went out, so nothing will complete it
            circuit.complete(ioid);
            self.inner.pool.release(handle);
            self.inner.io.end(token);
            if e.is_fatal_to_circuit() {
                self.teardown_circuit(registry, circuit.address(), &e, out);
            }
            return Err(e);
        }
        if let Some(channel) = registry.channels.get_mut(&cid) {
            channel.add_operation(handle);
        }
        trace!("Issued request {ioid} on channel {cid}");
        Ok(OperationId(handle))
    }

    /// Write a value without asking for any completion
    pub fn write(&self, cid: u32, value: DbrValue) -> Result<(), ClientError> {
        self.ensure_open()?;
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        let result = {
            let mut registry = self.registry();
            Self::target(&registry, cid).and_then(|target| {
                if !target.access.can_write() {
                    return Err(ClientError::AccessDenied);
                }
                let (count, data) = value.to_bytes(None);
                if count == 0 || count as u32 > target.native_count {
                    return Err(ClientError::InvalidUsage(format!(
                        "Cannot write {count} elements to a {} element channel",
                        target.native_count
                    )));
                }
                let message = Write {
                    data_type: DbrType::new(value.get_type(), DbrCategory::Basic),
                    data_count: count as u32,
                    server_id: target.server_id,
                    client_ioid: 0,
                    data,
                };
                self.send_or_teardown(&mut registry, &target.circuit, message, &mut out)
            })
        };
        self.deliver(out);
        result
    }

    /// Subscribe to changes of a channel.
    ///
    /// The subscription survives the channel losing its server: the callback
    /// is told [`ClientError::Disconnected`] and updates resume by themselves
    /// once the channel is claimed again.
    pub fn subscribe(
        &self,
        cid: u32,
        category: DbrCategory,
        count: u32,
        mask: MonitorMask,
        callback: SubscriptionCallback,
    ) -> Result<OperationId, ClientError> {
        self.ensure_open()?;
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        let result = {
            let mut registry = self.registry();
            self.subscribe_locked(&mut registry, cid, category, count, mask, callback, &mut out)
        };
        self.deliver(out);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn subscribe_locked(
        &self,
        registry: &mut Registry,
        cid: u32,
        category: DbrCategory,
        count: u32,
        mask: MonitorMask,
        callback: SubscriptionCallback,
        out: &mut Vec<Delivery>,
    ) -> Result<OperationId, ClientError> {
        let Some(channel) = registry.channels.get_mut(&cid) else {
            return Err(no_such_channel(cid));
        };
        let mut record =
            CompletionRecord::new(cid, category, count, Notify::Subscription(callback));
        record.mask = mask;
        let handle = self.inner.pool.allocate(SizeClass::Subscription, record);
        channel.add_operation(handle);
        if channel.state() != ChannelState::Claimed {
            debug!("Subscription on channel {cid} waits for the channel to connect");
            return Ok(OperationId(handle));
        }

        let target = Self::target(registry, cid)?;
        if let Err(e) = self.arm_subscription(&target, handle) {
            if let Some(channel) = registry.channels.get_mut(&cid) {
                channel.remove_operation(handle);
            }
            self.inner.pool.release(handle);
            if e.is_fatal_to_circuit() {
                self.teardown_circuit(registry, target.circuit.address(), &e, out);
            }
            return Err(e);
        }
        Ok(OperationId(handle))
    }

    /// Send the EVENT_ADD for a subscription on its channel's circuit
    fn arm_subscription(&self, target: &Target, handle: SlotHandle) -> Result<(), ClientError> {
        let circuit = &target.circuit;
        let Some((category, count, mask)) = self
            .inner
            .pool
            .with(handle, |r| {
                (r.is_subscription() && r.request_id.is_none())
                    .then_some((r.category, r.data_count, r.mask))
            })
            .flatten()
        else {
            return Ok(());
        };
        let data_type = DbrType::new(target.native_type, category);
        let data_count = request_count(count, target.native_count, circuit.effective_version());
        let ioid = circuit.register(handle);
        self.inner.pool.with(handle, |r| {
            r.request_id = Some(ioid);
            r.circuit = Some(circuit.address());
            r.data_type = Some(data_type);
        });
        let sent = circuit.send(EventAdd {
            data_type,
            data_count,
            server_id: target.server_id,
            subscription_id: ioid,
            mask,
        });
        if sent.is_err() {
            circuit.complete(ioid);
            self.inner.pool.with(handle, |r| r.detach());
        } else {
            debug!("Armed subscription {ioid} on {}", circuit.address());
        }
        sent
    }

    /// Cancel a subscription. No further updates are delivered once this returns.
    pub fn cancel_subscription(&self, operation: OperationId) -> Result<(), ClientError> {
        let handle = operation.0;
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        let result = {
            let mut registry = self.registry();
            match self.inner.pool.with(handle, |r| r.is_subscription()) {
                None => Err(ClientError::InvalidUsage(
                    "Unknown or finished operation".to_string(),
                )),
                Some(false) => Err(ClientError::InvalidUsage(
                    "Only subscriptions can be cancelled".to_string(),
                )),
                Some(true) => {
                    self.cancel_locked(&mut registry, handle, &mut out);
                    Ok(())
                }
            }
        };
        self.deliver(out);
        result
    }

    fn cancel_locked(&self, registry: &mut Registry, handle: SlotHandle, out: &mut Vec<Delivery>) {
        let Some(record) = self.inner.pool.release(handle) else {
            return;
        };
        let Some(channel) = registry.channels.get_mut(&record.channel) else {
            return;
        };
        channel.remove_operation(handle);
        let server_id = channel.server_id();
        let circuit = record
            .circuit
            .and_then(|address| registry.circuits.get(&address).cloned());
        if let (Some(circuit), Some(ioid)) = (circuit, record.request_id) {
            circuit.complete(ioid);
            if let (Some(server_id), Some(data_type)) = (server_id, record.data_type) {
                debug!("Cancelling subscription {ioid}");
                let _ = self.send_or_teardown(
                    registry,
                    &circuit,
                    EventCancel {
                        data_type,
                        data_count: record.data_count,
                        server_id,
                        subscription_id: ioid,
                    },
                    out,
                );
            }
        }
    }

    /// Block until every read and notified write has completed.
    ///
    /// On timeout everything still outstanding is completed with
    /// [`ClientError::Timeout`] and forgotten, as by [`ClientContext::reset_io`].
    /// Must not be called from a callback, or from an async task.
    pub fn pend_io(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.in_callback() {
            return Err(ClientError::InvalidUsage(
                "Cannot wait for IO from inside a callback".to_string(),
            ));
        }
        if self.inner.io.wait_for_drain(timeout) {
            Ok(())
        } else {
            self.reset_io_with(ClientError::Timeout);
            Err(ClientError::Timeout)
        }
    }

    /// As [`ClientContext::pend_io`], for async callers
    pub async fn pend_io_async(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.inner.io.wait_for_drain_async(timeout).await {
            Ok(())
        } else {
            self.reset_io_with(ClientError::Timeout);
            Err(ClientError::Timeout)
        }
    }

    /// Abandon every outstanding read and notified write. Their callbacks
    /// receive [`ClientError::Cancelled`]; replies that arrive later are dropped.
    pub fn reset_io(&self) {
        self.reset_io_with(ClientError::Cancelled);
    }

    fn reset_io_with(&self, error: ClientError) {
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        {
            let registry = self.registry();
            let generation = self.inner.io.reset_generation();
            debug!("IO reset, now generation {generation}");
            for channel in registry.channels.values() {
                for &handle in channel.operations() {
                    let delivery = self
                        .inner
                        .pool
                        .with(handle, |r| {
                            if r.is_subscription() {
                                None
                            } else {
                                r.retire().failure(handle, error.clone())
                            }
                        })
                        .flatten();
                    out.extend(delivery);
                }
            }
        }
        self.deliver(out);
    }

    /// Search datagrams that are due now, and when to ask again
    pub fn poll_search(&self, now: Instant) -> (Vec<Vec<u8>>, Option<Instant>) {
        let mut discovery = self.discovery();
        let datagrams = discovery.poll_due(now);
        (datagrams, discovery.next_deadline())
    }

    /// A server answered a search
    pub fn search_reply(&self, search_id: u32, server: SocketAddr, minor_version: u16) {
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        {
            let mut registry = self.registry();
            let Some(cid) = self.discovery().accept_reply(search_id) else {
                return;
            };
            let _span = debug_span!("search_reply", cid).entered();
            debug!("Found channel {cid} on {server} (minor version {minor_version})");
            self.connect_channel(&mut registry, cid, server, minor_version, &mut out);
        }
        self.deliver(out);
    }

    fn circuit_for(
        &self,
        registry: &mut Registry,
        server: SocketAddr,
        minor_version: u16,
    ) -> Arc<Circuit> {
        if let Some(circuit) = registry.circuits.get(&server) {
            return circuit.clone();
        }
        debug!("Creating circuit to {server}");
        let circuit = Arc::new(Circuit::new(
            server,
            minor_version,
            &self.inner.config,
            Instant::now(),
        ));
        registry.circuits.insert(server, circuit.clone());
        self.beacons().register_circuit(server);
        self.inner.transport.connect(self.downgrade(), circuit.clone());
        circuit
    }

    /// Send the claim for a searching channel to a server
    fn connect_channel(
        &self,
        registry: &mut Registry,
        cid: u32,
        server: SocketAddr,
        minor_version: u16,
        out: &mut Vec<Delivery>,
    ) {
        match registry.channels.get(&cid) {
            Some(channel) if channel.state() == ChannelState::Searching => (),
            _ => return,
        }
        let circuit = self.circuit_for(registry, server, minor_version);
        let Some(channel) = registry.channels.get_mut(&cid) else {
            return;
        };
        channel.connecting(server);
        circuit.claim(cid);
        let message = CreateChannel {
            client_id: cid,
            protocol_version: CLIENT_MINOR_VERSION as u32,
            channel_name: channel.name.clone(),
        };
        let _ = self.send_or_teardown(registry, &circuit, message, out);
    }

    /// A beacon arrived from a server
    pub fn beacon(&self, server: SocketAddr, sequence: u32, minor_version: u16) {
        let now = Instant::now();
        let verdict = self
            .beacons()
            .beacon_received(server, sequence, minor_version, now);
        if matches!(verdict, BeaconVerdict::Regular | BeaconVerdict::Discarded) {
            return;
        }
        debug!("Beacon from {server}: {verdict:?}");
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        {
            let mut registry = self.registry();
            if let BeaconVerdict::Anomaly { .. } = verdict {
                if let Some(circuit) = registry.circuits.get(&server).cloned() {
                    if let Err(e) = circuit.send_echo(now) {
                        self.teardown_circuit(&mut registry, server, &e, &mut out);
                    }
                }
            }
            if matches!(
                verdict,
                BeaconVerdict::First | BeaconVerdict::Anomaly { net_change: true }
            ) {
                self.discovery().boost(now);
                self.inner.transport.wake_search();
            }
            // Channels that last lived on this server go straight back to it
            let returning: Vec<u32> = registry
                .channels
                .values()
                .filter(|c| c.state() == ChannelState::Searching && c.last_server() == Some(server))
                .map(|c| c.cid)
                .collect();
            for cid in returning {
                debug!("Reclaiming channel {cid} on reappeared server {server}");
                self.discovery().remove(cid);
                self.connect_channel(&mut registry, cid, server, minor_version, &mut out);
            }
        }
        self.deliver(out);
    }

    /// The TCP connection for a circuit is established
    pub fn circuit_connected(&self, circuit: &Arc<Circuit>) {
        let registry = self.registry();
        if Self::is_current(&registry, circuit) && circuit.set_connected(Instant::now()) {
            debug!("Circuit to {} connected", circuit.address());
        }
    }

    /// A circuit's connection failed or was closed by the server
    pub fn circuit_failed(&self, circuit: &Arc<Circuit>, error: ClientError) {
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        {
            let mut registry = self.registry();
            if !Self::is_current(&registry, circuit) {
                debug!("Ignoring failure of retired circuit {}: {error}", circuit.address());
                return;
            }
            self.teardown_circuit(&mut registry, circuit.address(), &error, &mut out);
        }
        self.deliver(out);
    }

    /// Receive flow control, see [`Circuit::receive_backlog`]
    pub fn circuit_receive_backlog(&self, circuit: &Arc<Circuit>, buffered: bool) {
        if let Err(e) = circuit.receive_backlog(buffered, self.inner.config.flow_control_threshold)
        {
            if e.is_fatal_to_circuit() {
                self.circuit_failed(circuit, e);
            }
        }
    }

    /// A message arrived on a circuit
    pub fn circuit_message(&self, circuit: &Arc<Circuit>, message: ClientMessage) {
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        {
            let mut registry = self.registry();
            if !Self::is_current(&registry, circuit) {
                trace!("Dropping message from retired circuit {}", circuit.address());
                return;
            }
            let now = Instant::now();
            circuit.note_received(now);
            if let Err(e) = self.dispatch(&mut registry, circuit, message, now, &mut out) {
                self.teardown_circuit(&mut registry, circuit.address(), &e, &mut out);
            }
        }
        self.deliver(out);
    }

    fn dispatch(
        &self,
        registry: &mut Registry,
        circuit: &Arc<Circuit>,
        message: ClientMessage,
        now: Instant,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ClientError> {
        trace!("Received from {}: {message:?}", circuit.address());
        if !matches!(message, ClientMessage::Version(_)) {
            circuit.assume_search_version()?;
        }
        match message {
            ClientMessage::Version(version) => {
                circuit.negotiate(version.protocol_version)?;
            }
            ClientMessage::Echo => (),
            ClientMessage::AccessRights(msg) => {
                if let Some(channel) = registry.channels.get_mut(&msg.client_id) {
                    if channel.circuit() == Some(circuit.address()) {
                        channel.set_access(msg.access_rights);
                    }
                }
            }
            ClientMessage::CreateChannelResponse(msg) => {
                self.claim_acknowledged(registry, circuit, msg, out)?
            }
            ClientMessage::CreateChannelFailure(msg) => {
                self.claim_refused(registry, circuit, msg.client_id, now)
            }
            ClientMessage::ServerDisconnect(msg) => {
                let cid = msg.client_id;
                if circuit.has_channel(cid) {
                    warn!("Server {} dropped channel {cid}", circuit.address());
                    let empty = circuit.unclaim(cid);
                    self.channel_lost(registry, Some(circuit.as_ref()), cid, now, out);
                    if empty {
                        self.close_circuit(registry, circuit);
                    }
                }
            }
            ClientMessage::ReadNotifyResponse(msg) => {
                let result = status_result(msg.status_code).and_then(|_| {
                    Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data).map_err(
                        |e| {
                            warn!("Could not decode read reply {}: {e}", msg.client_ioid);
                            ClientError::from(e)
                        },
                    )
                });
                self.complete_one_shot(registry, circuit, msg.client_ioid, Reply::Read(result), out);
            }
            ClientMessage::WriteNotifyResponse(msg) => {
                let result = status_result(msg.status_code);
                self.complete_one_shot(registry, circuit, msg.client_ioid, Reply::Write(result), out);
            }
            ClientMessage::EventAddResponse(msg) => self.subscription_event(circuit, msg, out),
            ClientMessage::ECAError(msg) => self.server_error(registry, circuit, msg, now, out),
            ClientMessage::ClearChannel(msg) => {
                trace!("Server confirmed clearing channel {}", msg.client_id)
            }
            other => warn!("Unexpected message on circuit {}: {other:?}", circuit.address()),
        }
        Ok(())
    }

    fn claim_acknowledged(
        &self,
        registry: &mut Registry,
        circuit: &Arc<Circuit>,
        response: CreateChannelResponse,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ClientError> {
        let cid = response.client_id;
        let _span = debug_span!("claim", cid).entered();
        let Some(channel) = registry
            .channels
            .get_mut(&cid)
            .filter(|c| c.circuit() == Some(circuit.address()))
        else {
            // The server now holds a channel nobody here wants
            debug!("Claim acknowledged for unknown channel, clearing it");
            let clear = ClearChannel {
                server_id: response.server_id,
                client_id: cid,
            };
            return match circuit.send(clear) {
                Err(e) if e.is_fatal_to_circuit() => Err(e),
                _ => Ok(()),
            };
        };
        if !channel.claimed(&response) {
            debug!("Ignoring claim acknowledgement for channel in {:?}", channel.state());
            return Ok(());
        }
        let info = channel.info();
        let handler = channel.on_connect();
        let operations = channel.operations().to_vec();
        let target = Self::target(registry, cid)?;
        for handle in operations {
            match self.arm_subscription(&target, handle) {
                Ok(()) => (),
                Err(e) if e.is_fatal_to_circuit() => return Err(e),
                Err(e) => {
                    let delivery = self
                        .inner
                        .pool
                        .with(handle, |r| r.retire().failure(handle, e))
                        .flatten();
                    out.extend(delivery);
                }
            }
        }
        if let (Some(handler), Some(info)) = (handler, info) {
            out.push(Delivery::Connection(handler, ConnectionEvent::Connected(info)));
        }
        Ok(())
    }

    /// The server would not create the channel: search again, and do not
    /// come straight back to this server.
    fn claim_refused(&self, registry: &mut Registry, circuit: &Arc<Circuit>, cid: u32, now: Instant) {
        let Some(channel) = registry.channels.get_mut(&cid) else {
            return;
        };
        if channel.circuit() != Some(circuit.address())
            || channel.state() != ChannelState::Connecting
        {
            return;
        }
        warn!(
            "Server {} refused to create channel '{}'",
            circuit.address(),
            channel.name
        );
        channel.forget_server();
        channel.disconnected();
        channel.searching();
        let name = channel.name.clone();
        self.discovery().install_deferred(
            cid,
            &name,
            now + self.inner.config.connection_timeout,
        );
        if circuit.unclaim(cid) {
            self.close_circuit(registry, circuit);
        }
    }

    /// Route a reply to the read or write waiting for it
    fn complete_one_shot(
        &self,
        registry: &mut Registry,
        circuit: &Circuit,
        ioid: u32,
        reply: Reply,
        out: &mut Vec<Delivery>,
    ) {
        let Some(handle) = circuit.lookup(ioid) else {
            debug!("Reply to unknown request {ioid} on {}", circuit.address());
            return;
        };
        if self.inner.pool.with(handle, |r| r.is_subscription()) != Some(false) {
            warn!("Reply to request {ioid} does not match a read or write");
            return;
        }
        circuit.complete(ioid);
        let Some(mut record) = self.inner.pool.release(handle) else {
            return;
        };
        if let Some(channel) = registry.channels.get_mut(&record.channel) {
            channel.remove_operation(handle);
        }
        let current = record.token.is_some_and(|token| self.inner.io.end(token));
        if record.is_retired() || !current {
            debug!("Dropping reply {ioid}: {}", ClientError::StaleCompletion);
            return;
        }
        match (record.retire(), reply) {
            (Notify::Read(callback), Reply::Read(result)) => {
                out.push(Delivery::Read(callback, result))
            }
            (Notify::Write(callback), Reply::Write(result)) => {
                out.push(Delivery::Write(callback, result))
            }
            (notify, _) => {
                warn!("Reply to request {ioid} is of the wrong kind");
                out.extend(notify.failure(
                    handle,
                    ClientError::Malformed("Reply of the wrong kind".to_string()),
                ));
            }
        }
    }

    fn subscription_event(
        &self,
        circuit: &Circuit,
        event: EventAddResponse,
        out: &mut Vec<Delivery>,
    ) {
        let Some(handle) = circuit.lookup(event.subscription_id) else {
            trace!("Update for unknown subscription {}", event.subscription_id);
            return;
        };
        if event.is_cancel_confirmation() {
            debug!("Server ended subscription {}", event.subscription_id);
            return;
        }
        let result = status_result(event.status_code).and_then(|_| {
            Dbr::from_bytes(event.data_type, event.data_count as usize, &event.data).map_err(|e| {
                warn!("Could not decode update {}: {e}", event.subscription_id);
                ClientError::from(e)
            })
        });
        self.subscription_result(handle, result, out);
    }

    fn subscription_result(
        &self,
        handle: SlotHandle,
        result: Result<Dbr, ClientError>,
        out: &mut Vec<Delivery>,
    ) {
        let delivery = self
            .inner
            .pool
            .with(handle, |record| match record.retire() {
                Notify::Subscription(callback) => {
                    Some(Delivery::Event(handle, callback, result))
                }
                other => {
                    record.notify = other;
                    None
                }
            })
            .flatten();
        out.extend(delivery);
    }

    /// The server reports a request failed; it quotes the request's header
    fn server_error(
        &self,
        registry: &mut Registry,
        circuit: &Arc<Circuit>,
        message: ECAError,
        now: Instant,
        out: &mut Vec<Delivery>,
    ) {
        let error = message.condition().map(ClientError::from).unwrap_or_else(|| {
            ClientError::Malformed(format!("Unknown status code {:#x}", message.status_code))
        });
        let request = message.original_request;
        warn!(
            "Server {} rejected command {}: {error} ({})",
            circuit.address(),
            request.command,
            message.error_message
        );
        match request.command {
            command::READ_NOTIFY => self.complete_one_shot(
                registry,
                circuit,
                request.parameter_2,
                Reply::Read(Err(error)),
                out,
            ),
            command::WRITE_NOTIFY => self.complete_one_shot(
                registry,
                circuit,
                request.parameter_2,
                Reply::Write(Err(error)),
                out,
            ),
            command::EVENT_ADD => {
                if let Some(handle) = circuit.lookup(request.parameter_2) {
                    self.subscription_result(handle, Err(error), out);
                }
            }
            command::CREATE_CHAN => self.claim_refused(registry, circuit, request.parameter_1, now),
            _ => (),
        }
    }

    fn send_or_teardown(
        &self,
        registry: &mut Registry,
        circuit: &Circuit,
        message: impl Into<Message>,
        out: &mut Vec<Delivery>,
    ) -> Result<(), ClientError> {
        let result = circuit.send(message);
        if let Err(e) = &result {
            if e.is_fatal_to_circuit() {
                self.teardown_circuit(registry, circuit.address(), e, out);
            }
        }
        result
    }

    /// Everything on a channel whose server went away: reads and writes
    /// fail, subscriptions are told and kept, and the channel searches again.
    fn channel_lost(
        &self,
        registry: &mut Registry,
        circuit: Option<&Circuit>,
        cid: u32,
        now: Instant,
        out: &mut Vec<Delivery>,
    ) {
        let Some(channel) = registry.channels.get_mut(&cid) else {
            return;
        };
        let was_claimed = channel.state() == ChannelState::Claimed;
        if !channel.disconnected() {
            return;
        }
        for handle in channel.operations().to_vec() {
            match self.inner.pool.with(handle, |r| r.kind()) {
                None => channel.remove_operation(handle),
                Some(OperationKind::Subscription) => {
                    let delivery = self
                        .inner
                        .pool
                        .with(handle, |record| {
                            let ioid = record.request_id?;
                            if let Some(circuit) = circuit {
                                circuit.complete(ioid);
                            }
                            record.detach();
                            record.retire().failure(handle, ClientError::Disconnected)
                        })
                        .flatten();
                    out.extend(delivery);
                }
                Some(_) => {
                    if let Some(mut record) = self.inner.pool.release(handle) {
                        if let (Some(circuit), Some(ioid)) = (circuit, record.request_id) {
                            circuit.complete(ioid);
                        }
                        if let Some(token) = record.token {
                            self.inner.io.end(token);
                        }
                        out.extend(record.retire().failure(handle, ClientError::Disconnected));
                    }
                    channel.remove_operation(handle);
                }
            }
        }
        if was_claimed {
            if let Some(handler) = channel.on_connect() {
                out.push(Delivery::Connection(handler, ConnectionEvent::Disconnected));
            }
        }
        channel.searching();
        let name = channel.name.clone();
        self.discovery().install(cid, &name, now);
        self.inner.transport.wake_search();
    }

    /// Take a circuit down after an error. Does nothing if it is already gone.
    fn teardown_circuit(
        &self,
        registry: &mut Registry,
        address: SocketAddr,
        reason: &ClientError,
        out: &mut Vec<Delivery>,
    ) {
        let Some(circuit) = registry.circuits.remove(&address) else {
            return;
        };
        let Some(summary) = circuit.teardown() else {
            return;
        };
        error!("Circuit to {address} torn down: {reason}");
        self.beacons().unregister_circuit(&address);
        let now = Instant::now();
        for cid in summary.channels {
            self.channel_lost(registry, None, cid, now, out);
        }
        // Requests not owned by any channel claimed on this circuit
        for (_, handle) in summary.in_flight {
            if self.inner.pool.with(handle, |r| r.is_subscription()) != Some(false) {
                continue;
            }
            if let Some(mut record) = self.inner.pool.release(handle) {
                if let Some(channel) = registry.channels.get_mut(&record.channel) {
                    channel.remove_operation(handle);
                }
                if let Some(token) = record.token {
                    self.inner.io.end(token);
                }
                out.extend(record.retire().failure(handle, ClientError::Disconnected));
            }
        }
    }

    /// Shut down a circuit nothing uses any more, once its queue is flushed
    fn close_circuit(&self, registry: &mut Registry, circuit: &Arc<Circuit>) {
        if Self::is_current(registry, circuit) {
            registry.circuits.remove(&circuit.address());
        }
        circuit.close();
        self.beacons().unregister_circuit(&circuit.address());
    }

    /// Time-driven checks: connection and handshake timeouts, echo liveness
    /// and beacon silence.
    pub fn check_liveness(&self, now: Instant) {
        let config = &self.inner.config;
        let echo_period = config.connection_timeout / 2;
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        {
            let mut registry = self.registry();
            let circuits: Vec<Arc<Circuit>> = registry.circuits.values().cloned().collect();
            for circuit in circuits {
                let address = circuit.address();
                let failure = if circuit.connect_expired(now, config.connection_timeout) {
                    Some(ClientError::Timeout)
                } else if circuit.handshake_expired(now, config.handshake_timeout) {
                    circuit.assume_search_version().err()
                } else {
                    match circuit.liveness(now, echo_period) {
                        Liveness::Alive => None,
                        Liveness::Quiet => circuit.send_echo(now).err(),
                        Liveness::Unresponsive => {
                            warn!("Circuit to {address} did not answer an echo");
                            Some(ClientError::Disconnected)
                        }
                    }
                };
                let failure = failure.or_else(|| {
                    let beacons = self.beacons();
                    let multiplier = config.beacon_silence_multiplier;
                    let period = beacons.period(&address)?;
                    (beacons.is_silent(&address, multiplier, now)
                        && circuit.idle_for(now) >= period.mul_f64(multiplier))
                    .then(|| {
                        warn!("Server {address} has stopped sending beacons");
                        ClientError::Disconnected
                    })
                });
                if let Some(error) = failure {
                    self.teardown_circuit(&mut registry, address, &error, &mut out);
                }
            }
        }
        self.deliver(out);
    }

    /// Destroy every channel and circuit. Later calls fail with
    /// [`ClientError::ClientClosed`].
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutting down client context");
        let _guard = self.callback_guard();
        let mut out = Vec::new();
        {
            let mut registry = self.registry();
            let cids: Vec<u32> = registry.channels.keys().copied().collect();
            for cid in cids {
                let _ = self.destroy_locked(&mut registry, cid, &mut out);
            }
            let addresses: Vec<SocketAddr> = registry.circuits.keys().copied().collect();
            for address in addresses {
                self.teardown_circuit(&mut registry, address, &ClientError::ClientClosed, &mut out);
            }
            self.inner.io.reset_generation();
        }
        self.deliver(out);
        self.inner.transport.shutdown();
    }

    /// Assert the structural invariants of the registry
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let registry = self.registry();
        let discovery = self.discovery();
        let mut claimed_on: HashMap<u32, SocketAddr> = HashMap::new();
        for (address, circuit) in &registry.circuits {
            assert_eq!(circuit.address(), *address);
            for cid in circuit.channels() {
                assert!(
                    claimed_on.insert(cid, *address).is_none(),
                    "channel {cid} is claimed on two circuits"
                );
                let channel = &registry.channels[&cid];
                assert_eq!(channel.circuit(), Some(*address));
            }
            for (ioid, handle) in circuit.in_flight() {
                let request = self.inner.pool.with(handle, |r| r.request_id).flatten();
                assert_eq!(request, Some(ioid), "request {ioid} on {address}");
            }
        }
        for channel in registry.channels.values() {
            match channel.state() {
                ChannelState::Searching => {
                    assert!(channel.circuit().is_none());
                    assert!(discovery.is_searching(channel.cid));
                }
                ChannelState::Connecting | ChannelState::Claimed => {
                    assert_eq!(claimed_on.get(&channel.cid).copied(), channel.circuit());
                    assert!(!discovery.is_searching(channel.cid));
                }
                state => panic!("channel {} left in {state:?}", channel.cid),
            }
            for handle in channel.operations() {
                assert!(self.inner.pool.contains(*handle));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dbr::{DbrValue, Status},
        messages::{
            AccessRights, CreateChannelFailure, Header, ServerDisconnect, Version,
            WriteNotifyResponse, ReadNotifyResponse,
        },
    };
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ManualTransport {
        connects: Mutex<Vec<Arc<Circuit>>>,
        search_wakes: AtomicUsize,
    }

    impl ManualTransport {
        fn circuits(&self) -> Vec<Arc<Circuit>> {
            self.connects.lock().unwrap().clone()
        }
        fn last_circuit(&self) -> Arc<Circuit> {
            self.connects.lock().unwrap().last().unwrap().clone()
        }
    }

    impl Transport for ManualTransport {
        fn connect(&self, _context: WeakContext, circuit: Arc<Circuit>) {
            self.connects.lock().unwrap().push(circuit);
        }
        fn wake_search(&self) {
            self.search_wakes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::builder()
            .search_addresses(Vec::new())
            .client_name("test")
            .host_name("testhost")
            .build()
    }

    fn context_with(config: ClientConfig) -> (ClientContext, Arc<ManualTransport>) {
        let transport = Arc::new(ManualTransport::default());
        (ClientContext::new(config, transport.clone()), transport)
    }

    fn server(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 5064))
    }

    /// Search ids sent for each channel name in this round
    fn poll(context: &ClientContext, now: Instant) -> Vec<(u32, String)> {
        let (datagrams, _) = context.poll_search(now);
        datagrams
            .iter()
            .flat_map(|d| Message::parse_many(d).unwrap())
            .filter_map(|m| match m {
                Message::Search(s) => Some((s.search_id, s.channel_name)),
                _ => None,
            })
            .collect()
    }

    fn sent(circuit: &Circuit) -> Vec<Message> {
        circuit
            .take_outgoing()
            .map(|bytes| Message::parse_many(&bytes).unwrap())
            .unwrap_or_default()
    }

    /// Answer every outstanding search from `address`
    fn answer_searches(context: &ClientContext, address: SocketAddr) {
        for (id, _) in poll(context, Instant::now()) {
            context.search_reply(id, address, 13);
        }
    }

    /// Bring a circuit up and acknowledge every claim on it
    fn acknowledge(context: &ClientContext, circuit: &Arc<Circuit>, native: DbrBasicType, count: u32) {
        context.circuit_connected(circuit);
        context.circuit_message(circuit, Version::default().into());
        for message in sent(circuit) {
            if let Message::CreateChannel(create) = message {
                context.circuit_message(
                    circuit,
                    AccessRights {
                        client_id: create.client_id,
                        access_rights: Access::ReadWrite,
                    }
                    .into(),
                );
                context.circuit_message(
                    circuit,
                    CreateChannelResponse {
                        data_type: native,
                        data_count: count,
                        client_id: create.client_id,
                        server_id: create.client_id + 1000,
                    }
                    .into(),
                );
            }
        }
    }

    /// Create a channel and take it all the way to claimed
    fn connected_channel(
        context: &ClientContext,
        transport: &ManualTransport,
        name: &str,
        address: SocketAddr,
    ) -> (u32, Arc<Circuit>) {
        let cid = context.create_channel(name, None).unwrap();
        answer_searches(context, address);
        let circuit = transport.last_circuit();
        acknowledge(context, &circuit, DbrBasicType::Float, 1);
        assert_eq!(context.channel_state(cid), Some(ChannelState::Claimed));
        (cid, circuit)
    }

    type Results<T> = Arc<Mutex<Vec<Result<T, ClientError>>>>;

    fn recorder<T: Send + 'static>() -> (Results<T>, impl FnMut(Result<T, ClientError>) + Send + 'static) {
        let results: Results<T> = Arc::default();
        let sink = results.clone();
        (results, move |r| sink.lock().unwrap().push(r))
    }

    fn float_reply(ioid: u32, value: f32) -> ClientMessage {
        ReadNotifyResponse {
            data_type: DbrType::new(DbrBasicType::Float, DbrCategory::Basic),
            data_count: 1,
            status_code: ECA_NORMAL,
            client_ioid: ioid,
            data: value.to_be_bytes().to_vec(),
        }
        .into()
    }

    fn float_event(subscription_id: u32, value: f32) -> ClientMessage {
        EventAddResponse {
            data_type: DbrType::new(DbrBasicType::Float, DbrCategory::Basic),
            data_count: 1,
            status_code: ECA_NORMAL,
            subscription_id,
            data: value.to_be_bytes().to_vec(),
        }
        .into()
    }

    fn read_ids(messages: &[Message]) -> Vec<u32> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::ReadNotify(r) => Some(r.client_ioid),
                _ => None,
            })
            .collect()
    }

    fn event_add_ids(messages: &[Message]) -> Vec<u32> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::EventAdd(e) => Some(e.subscription_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn read_completes_once_with_value() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        context.check_invariants();

        let (results, callback) = recorder();
        context
            .read_notify(cid, DbrCategory::Basic, 1, Box::new(callback))
            .unwrap();
        assert_eq!(context.pending_io(), 1);
        let ioid = read_ids(&sent(&circuit))[0];

        context.circuit_message(&circuit, float_reply(ioid, 3.14));
        // A duplicate reply finds nothing
        context.circuit_message(&circuit, float_reply(ioid, 2.71));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        let dbr = results[0].as_ref().unwrap();
        assert_eq!(dbr.value(), &DbrValue::Float(vec![3.14]));
        assert_eq!(context.pending_io(), 0);
        assert!(context.pend_io(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn subscription_survives_circuit_loss() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let (results, callback) = recorder();
        context
            .subscribe(cid, DbrCategory::Basic, 1, MonitorMask::default(), Box::new(callback))
            .unwrap();
        let first_id = event_add_ids(&sent(&circuit))[0];
        context.circuit_message(&circuit, float_event(first_id, 1.0));

        context.circuit_failed(
            &circuit,
            std::io::Error::from(std::io::ErrorKind::ConnectionReset).into(),
        );
        assert_eq!(context.channel_state(cid), Some(ChannelState::Searching));
        assert_eq!(context.circuit_count(), 0);
        context.check_invariants();
        // Late traffic on the dead circuit goes nowhere
        context.circuit_message(&circuit, float_event(first_id, 9.0));

        answer_searches(&context, server(1));
        let circuit = transport.last_circuit();
        acknowledge(&context, &circuit, DbrBasicType::Float, 1);
        // The subscription was re-armed without being asked
        let second_id = event_add_ids(&sent(&circuit))[0];
        context.circuit_message(&circuit, float_event(second_id, 2.0));
        context.check_invariants();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0].as_ref().unwrap().value(),
            &DbrValue::Float(vec![1.0])
        );
        assert!(matches!(results[1], Err(ClientError::Disconnected)));
        assert_eq!(
            results[2].as_ref().unwrap().value(),
            &DbrValue::Float(vec![2.0])
        );
    }

    #[test]
    fn stale_search_reply_is_discarded() {
        let (context, transport) = context_with(config());
        let cid = context.create_channel("X", None).unwrap();
        let start = Instant::now();
        let first = poll(&context, start);
        let retry = poll(&context, start + context.config().min_search_period);
        assert_eq!(first.len(), 1);
        assert_eq!(retry.len(), 1);

        context.search_reply(retry[0].0, server(1), 13);
        assert_eq!(context.channel_state(cid), Some(ChannelState::Connecting));
        context.search_reply(first[0].0, server(2), 13);
        assert_eq!(transport.circuits().len(), 1);
        assert_eq!(context.circuit_count(), 1);
        context.check_invariants();
    }

    #[test]
    fn backlog_overflow_only_affects_its_circuit() {
        let (context, transport) = context_with(
            ClientConfig::builder()
                .search_addresses(Vec::new())
                .client_name("test")
                .host_name("testhost")
                .send_backlog_limit(256)
                .build(),
        );
        let (full, full_circuit) = connected_channel(&context, &transport, "FULL", server(1));
        let (other, _) = connected_channel(&context, &transport, "OTHER", server(2));

        let (results, _) = recorder::<Dbr>();
        let mut issued = 0;
        let error = loop {
            let sink = results.clone();
            match context.read_notify(
                full,
                DbrCategory::Basic,
                1,
                Box::new(move |r| sink.lock().unwrap().push(r)),
            ) {
                Ok(_) => issued += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(error, ClientError::BackpressureExceeded { limit: 256 }));
        assert!(issued > 0);
        assert!(full_circuit.cancel_token().is_cancelled());
        assert_eq!(context.circuit_count(), 1);
        assert_eq!(context.channel_state(full), Some(ChannelState::Searching));
        assert_eq!(context.channel_state(other), Some(ChannelState::Claimed));
        // Everything that did go out failed with the circuit
        let results = results.lock().unwrap();
        assert_eq!(results.len(), issued);
        assert!(results.iter().all(|r| matches!(r, Err(ClientError::Disconnected))));
        assert_eq!(context.pending_io(), 0);
        context.check_invariants();
    }

    #[test]
    fn reused_slot_does_not_reach_old_callback() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));

        let (reads, read_callback) = recorder();
        let read = context
            .read_notify(cid, DbrCategory::Basic, 1, Box::new(read_callback))
            .unwrap();
        let read_id = read_ids(&sent(&circuit))[0];
        context.circuit_message(&circuit, float_reply(read_id, 1.5));

        let (writes, write_callback) = recorder();
        let write = context
            .write_notify(cid, DbrValue::Float(vec![4.0]), Box::new(write_callback))
            .unwrap();
        assert_eq!(write.0.index(), read.0.index());
        assert_ne!(write.0.generation(), read.0.generation());
        let write_id = match &sent(&circuit)[0] {
            Message::WriteNotify(w) => w.client_ioid,
            other => panic!("Expected a write, got {other:?}"),
        };
        // A repeat of the old reply must not reach anything
        context.circuit_message(&circuit, float_reply(read_id, 1.5));
        context.circuit_message(
            &circuit,
            WriteNotifyResponse {
                data_type: DbrType::new(DbrBasicType::Float, DbrCategory::Basic),
                data_count: 1,
                status_code: ECA_NORMAL,
                client_ioid: write_id,
            }
            .into(),
        );
        assert_eq!(reads.lock().unwrap().len(), 1);
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].is_ok());
    }

    #[test]
    fn reset_io_drops_late_replies() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let (results, callback) = recorder();
        context
            .read_notify(cid, DbrCategory::Basic, 1, Box::new(callback))
            .unwrap();
        let ioid = read_ids(&sent(&circuit))[0];

        assert!(matches!(
            context.pend_io(Duration::from_millis(10)),
            Err(ClientError::Timeout)
        ));
        assert_eq!(context.pending_io(), 0);
        context.circuit_message(&circuit, float_reply(ioid, 3.0));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ClientError::Timeout)));
        context.check_invariants();
    }

    #[test]
    fn destroy_cancels_everything() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let (events, callback) = recorder();
        context
            .subscribe(cid, DbrCategory::Time, 0, MonitorMask::default(), Box::new(callback))
            .unwrap();
        let (reads, read_callback) = recorder();
        context
            .read_notify(cid, DbrCategory::Basic, 0, Box::new(read_callback))
            .unwrap();
        let subscription_id = event_add_ids(&sent(&circuit))[0];

        context.destroy_channel(cid).unwrap();
        let messages = sent(&circuit);
        assert!(matches!(&messages[0], Message::EventCancel(c) if c.subscription_id == subscription_id));
        assert!(matches!(&messages[1], Message::ClearChannel(c) if c.client_id == cid && c.server_id == cid + 1000));
        assert!(circuit.is_closing());
        assert_eq!(context.circuit_count(), 0);
        assert_eq!(context.channel_state(cid), None);
        assert!(matches!(
            context.destroy_channel(cid),
            Err(ClientError::InvalidUsage(_))
        ));

        context.circuit_message(&circuit, float_event(subscription_id, 1.0));
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [Err(ClientError::Cancelled)]
        ));
        assert!(matches!(
            reads.lock().unwrap().as_slice(),
            [Err(ClientError::Cancelled)]
        ));
        assert_eq!(context.pending_io(), 0);
    }

    #[test]
    fn destroy_from_inside_a_callback() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let inner_context = context.clone();
        let counter = calls.clone();
        context
            .subscribe(
                cid,
                DbrCategory::Basic,
                1,
                MonitorMask::default(),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    inner_context.destroy_channel(cid).unwrap();
                }),
            )
            .unwrap();
        let id = event_add_ids(&sent(&circuit))[0];
        context.circuit_message(&circuit, float_event(id, 1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(context.channel_count(), 0);
        context.check_invariants();
    }

    #[test]
    fn connection_events() {
        let (context, transport) = context_with(config());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let cid = context
            .create_channel(
                "X",
                Some(Arc::new(move |event| sink.lock().unwrap().push(event))),
            )
            .unwrap();
        answer_searches(&context, server(1));
        let circuit = transport.last_circuit();
        acknowledge(&context, &circuit, DbrBasicType::Double, 4);
        let info = context.channel_info(cid).unwrap();
        assert_eq!(info.native_type, DbrBasicType::Double);
        assert_eq!(info.native_count, 4);
        assert_eq!(info.access, Access::ReadWrite);

        context.circuit_failed(&circuit, ClientError::Disconnected);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ConnectionEvent::Connected(info),
                ConnectionEvent::Disconnected
            ]
        );
    }

    #[test]
    fn server_errors_reach_the_request() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let (results, callback) = recorder();
        context
            .read_notify(cid, DbrCategory::Basic, 1, Box::new(callback))
            .unwrap();
        let request = sent(&circuit).remove(0).to_raw().header;
        context.circuit_message(
            &circuit,
            ECAError {
                client_id: cid,
                status_code: ErrorCondition::GetFail.status(),
                original_request: request,
                error_message: "no".to_string(),
            }
            .into(),
        );
        assert!(matches!(
            results.lock().unwrap().as_slice(),
            [Err(ClientError::Server(ErrorCondition::GetFail))]
        ));
        assert_eq!(context.channel_state(cid), Some(ChannelState::Claimed));
    }

    #[test]
    fn undecodable_reply_fails_only_the_request() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let (results, callback) = recorder();
        context
            .read_notify(cid, DbrCategory::Time, 1, Box::new(callback))
            .unwrap();
        let ioid = read_ids(&sent(&circuit))[0];
        context.circuit_message(
            &circuit,
            ReadNotifyResponse {
                data_type: DbrType::new(DbrBasicType::Float, DbrCategory::Time),
                data_count: 1,
                status_code: ECA_NORMAL,
                client_ioid: ioid,
                data: vec![0; 3],
            }
            .into(),
        );
        assert!(matches!(
            results.lock().unwrap().as_slice(),
            [Err(ClientError::Malformed(_))]
        ));
        assert_eq!(context.circuit_count(), 1);
    }

    #[test]
    fn refused_claim_searches_again() {
        let (context, transport) = context_with(config());
        let cid = context.create_channel("X", None).unwrap();
        answer_searches(&context, server(1));
        let circuit = transport.last_circuit();
        context.circuit_connected(&circuit);
        context.circuit_message(&circuit, CreateChannelFailure { client_id: cid }.into());
        assert_eq!(context.channel_state(cid), Some(ChannelState::Searching));
        assert_eq!(context.circuit_count(), 0);
        context.check_invariants();
        // The channel has no server to go back to on a beacon
        context.beacon(server(1), 1, 13);
        assert_eq!(context.channel_state(cid), Some(ChannelState::Searching));
    }

    #[test]
    fn server_disconnect_affects_one_channel() {
        let (context, transport) = context_with(config());
        let (a, circuit) = connected_channel(&context, &transport, "A", server(1));
        let (b, _) = connected_channel(&context, &transport, "B", server(1));
        assert_eq!(context.circuit_count(), 1);
        context.circuit_message(&circuit, ServerDisconnect { client_id: a }.into());
        assert_eq!(context.channel_state(a), Some(ChannelState::Searching));
        assert_eq!(context.channel_state(b), Some(ChannelState::Claimed));
        assert_eq!(context.circuit_count(), 1);
        context.check_invariants();
    }

    #[test]
    fn beacon_reclaims_without_search() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        context.circuit_failed(&circuit, ClientError::Disconnected);
        assert_eq!(context.channel_state(cid), Some(ChannelState::Searching));

        context.beacon(server(1), 10, 13);
        assert_eq!(context.channel_state(cid), Some(ChannelState::Connecting));
        assert_eq!(transport.circuits().len(), 2);
        assert!(poll(&context, Instant::now()).is_empty());
        context.check_invariants();
    }

    #[test]
    fn incompatible_server_is_dropped() {
        let (context, transport) = context_with(config());
        let cid = context.create_channel("X", None).unwrap();
        answer_searches(&context, server(1));
        let circuit = transport.last_circuit();
        context.circuit_connected(&circuit);
        context.circuit_message(
            &circuit,
            Version {
                priority: 0,
                protocol_version: 2,
            }
            .into(),
        );
        assert_eq!(context.circuit_count(), 0);
        assert_eq!(context.channel_state(cid), Some(ChannelState::Searching));
    }

    #[test]
    fn silent_circuit_is_echoed_then_dropped() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let half = context.config().connection_timeout / 2;
        let start = Instant::now();
        context.check_liveness(start + half);
        assert_eq!(sent(&circuit), vec![Message::Echo]);
        context.check_liveness(start + half + half / 2);
        assert_eq!(context.circuit_count(), 1);
        context.check_liveness(start + half * 2 + Duration::from_millis(1));
        assert_eq!(context.circuit_count(), 0);
        assert_eq!(context.channel_state(cid), Some(ChannelState::Searching));
    }

    #[test]
    fn beacon_silence_drops_circuit() {
        let (context, transport) = context_with(
            ClientConfig::builder()
                .search_addresses(Vec::new())
                .connection_timeout(Duration::from_secs(1000))
                .client_name("test")
                .host_name("testhost")
                .build(),
        );
        let (quiet, _) = connected_channel(&context, &transport, "QUIET", server(1));
        let (chatty, _) = connected_channel(&context, &transport, "CHATTY", server(2));
        let start = Instant::now();
        {
            let mut beacons = context.beacons();
            beacons.beacon_received(server(1), 1, 13, start);
            beacons.beacon_received(server(1), 2, 13, start + Duration::from_secs(1));
        }
        let silence = Duration::from_secs(1).mul_f64(context.config().beacon_silence_multiplier);

        // Within the allowance nothing happens
        context.check_liveness(start + Duration::from_secs(1) + silence / 2);
        assert_eq!(context.circuit_count(), 2);

        context.check_liveness(start + Duration::from_secs(2) + silence);
        assert_eq!(context.circuit_count(), 1);
        assert_eq!(context.channel_state(quiet), Some(ChannelState::Searching));
        assert_eq!(context.channel_state(chatty), Some(ChannelState::Claimed));
        context.check_invariants();
    }

    #[test]
    fn unwanted_claim_is_cleared() {
        let (context, transport) = context_with(config());
        let (keep, circuit) = connected_channel(&context, &transport, "KEEP", server(1));
        let gone = context.create_channel("GONE", None).unwrap();
        answer_searches(&context, server(1));
        assert!(matches!(&sent(&circuit)[..], [Message::CreateChannel(c)] if c.client_id == gone));
        context.destroy_channel(gone).unwrap();
        sent(&circuit);

        context.circuit_message(
            &circuit,
            CreateChannelResponse {
                data_type: DbrBasicType::Float,
                data_count: 1,
                client_id: gone,
                server_id: 4242,
            }
            .into(),
        );
        assert!(matches!(
            &sent(&circuit)[..],
            [Message::ClearChannel(c)] if c.server_id == 4242 && c.client_id == gone
        ));
        assert_eq!(context.channel_state(keep), Some(ChannelState::Claimed));
        assert_eq!(context.circuit_count(), 1);
        context.check_invariants();
    }

    #[test]
    fn requests_on_unclaimed_channels() {
        let (context, _) = context_with(config());
        let cid = context.create_channel("X", None).unwrap();
        let (_, callback) = recorder();
        assert!(matches!(
            context.read_notify(cid, DbrCategory::Basic, 1, Box::new(callback)),
            Err(ClientError::Disconnected)
        ));
        let (_, callback) = recorder::<Dbr>();
        assert!(matches!(
            context.read_notify(999, DbrCategory::Basic, 1, Box::new(callback)),
            Err(ClientError::InvalidUsage(_))
        ));
        assert!(matches!(
            context.write(cid, DbrValue::Long(vec![1])),
            Err(ClientError::Disconnected)
        ));
        assert!(matches!(
            context.create_channel("", None),
            Err(ClientError::InvalidUsage(_))
        ));
        // Subscriptions wait for the channel instead
        let (_, callback) = recorder();
        assert!(context
            .subscribe(cid, DbrCategory::Basic, 0, MonitorMask::default(), Box::new(callback))
            .is_ok());
    }

    #[test]
    fn cancelled_subscription_is_quiet() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let (events, callback) = recorder();
        let op = context
            .subscribe(cid, DbrCategory::Basic, 1, MonitorMask::default(), Box::new(callback))
            .unwrap();
        let id = event_add_ids(&sent(&circuit))[0];
        context.cancel_subscription(op).unwrap();
        assert!(matches!(&sent(&circuit)[0], Message::EventCancel(c) if c.subscription_id == id));
        context.circuit_message(&circuit, float_event(id, 1.0));
        assert!(events.lock().unwrap().is_empty());
        assert!(matches!(
            context.cancel_subscription(op),
            Err(ClientError::InvalidUsage(_))
        ));
    }

    #[test]
    fn shutdown_closes_everything() {
        let (context, transport) = context_with(config());
        let (cid, _) = connected_channel(&context, &transport, "X", server(1));
        let (events, callback) = recorder();
        context
            .subscribe(cid, DbrCategory::Basic, 1, MonitorMask::default(), Box::new(callback))
            .unwrap();
        context.shutdown();
        assert_eq!(context.channel_count(), 0);
        assert_eq!(context.circuit_count(), 0);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [Err(ClientError::Cancelled)]
        ));
        assert!(matches!(
            context.create_channel("Y", None),
            Err(ClientError::ClientClosed)
        ));
    }

    #[test]
    fn time_metadata_is_decoded() {
        let (context, transport) = context_with(config());
        let (cid, circuit) = connected_channel(&context, &transport, "X", server(1));
        let (results, callback) = recorder();
        context
            .read_notify(cid, DbrCategory::Time, 1, Box::new(callback))
            .unwrap();
        let ioid = read_ids(&sent(&circuit))[0];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: std::time::UNIX_EPOCH + Duration::from_secs(1_000_000_000),
            value: DbrValue::Float(vec![7.5]),
        };
        let (count, data) = dbr.to_bytes(None);
        context.circuit_message(
            &circuit,
            ReadNotifyResponse {
                data_type: dbr.data_type(),
                data_count: count as u32,
                status_code: ECA_NORMAL,
                client_ioid: ioid,
                data,
            }
            .into(),
        );
        let results = results.lock().unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &dbr);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Create,
        Destroy(usize),
        Answer(u8),
        Acknowledge(u8),
        Fail(u8),
        Beacon(u8),
        Drop(usize),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Create),
            (0usize..8).prop_map(Event::Destroy),
            (1u8..4).prop_map(Event::Answer),
            (1u8..4).prop_map(Event::Acknowledge),
            (1u8..4).prop_map(Event::Fail),
            (1u8..4).prop_map(Event::Beacon),
            (0usize..8).prop_map(Event::Drop),
        ]
    }

    proptest! {
        #[test]
        fn channels_claim_at_most_one_circuit(events in prop::collection::vec(event(), 1..60)) {
            let (context, transport) = context_with(config());
            let mut cids = Vec::new();
            for event in events {
                match event {
                    Event::Create => cids.push(context.create_channel("PV", None).unwrap()),
                    Event::Destroy(i) if !cids.is_empty() => {
                        let cid = cids.remove(i % cids.len());
                        context.destroy_channel(cid).unwrap();
                    }
                    Event::Answer(n) => answer_searches(&context, server(n)),
                    Event::Acknowledge(n) => {
                        if let Some(circuit) = transport
                            .circuits()
                            .into_iter()
                            .rev()
                            .find(|c| c.address() == server(n))
                        {
                            acknowledge(&context, &circuit, DbrBasicType::Long, 1);
                        }
                    }
                    Event::Fail(n) => {
                        for circuit in transport.circuits() {
                            if circuit.address() == server(n) {
                                context.circuit_failed(&circuit, ClientError::Disconnected);
                            }
                        }
                    }
                    Event::Beacon(n) => context.beacon(server(n), 1, 13),
                    Event::Drop(i) if !cids.is_empty() => {
                        let cid = cids[i % cids.len()];
                        for circuit in transport.circuits() {
                            context.circuit_message(&circuit, ServerDisconnect { client_id: cid }.into());
                        }
                    }
                    _ => (),
                }
                context.check_invariants();
            }
            for cid in cids {
                context.destroy_channel(cid).unwrap();
            }
            prop_assert_eq!(context.circuit_count(), 0);
            prop_assert_eq!(context.channel_count(), 0);
        }
    }

    #[test]
    fn header_of_a_quoted_request_round_trips() {
        // ECA errors quote the failing request; make sure what we send can be quoted
        let header = Header::new(command::READ_NOTIFY, 0, 9, 1, 1001, 5);
        let raw = ECAError {
            client_id: 1,
            status_code: ErrorCondition::BadType.status(),
            original_request: header,
            error_message: String::new(),
        };
        let ClientMessage::ECAError(parsed) =
            ClientMessage::from_raw(ClientMessage::ECAError(raw).to_raw()).unwrap()
        else {
            panic!("Expected an error message");
        };
        assert_eq!(parsed.original_request, header);
    }
}
