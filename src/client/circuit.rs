//! State of one TCP virtual circuit to a server.
//!
//! A [`Circuit`] holds everything about a connection except the socket: the
//! outgoing byte queue, the requests in flight on it, the channels claimed on
//! it, and the timestamps the liveness checks work from. The transport reads
//! and writes the socket; the context decides what the messages mean.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::{ClientError, pool::SlotHandle},
    config::ClientConfig,
    messages::{
        CLIENT_MINOR_VERSION, ClientName, EXTENDED_HEADER_MINOR_VERSION, HostName,
        MINIMUM_MINOR_VERSION, Message, RawMessage, Version,
    },
    utils::IdAllocator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Waiting for the TCP connection to complete
    Connecting,
    Connected,
    /// Closed, either torn down on error or shut down once unused
    Disconnected,
}

/// What the echo liveness check found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Silent long enough that an echo should be sent
    Quiet,
    /// An echo went unanswered
    Unresponsive,
}

/// Everything a circuit was responsible for at the moment it went down
#[derive(Debug, Default)]
pub struct TeardownSummary {
    pub in_flight: Vec<(u32, SlotHandle)>,
    pub channels: Vec<u32>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    negotiated_version: Option<u16>,
    queue: BytesMut,
    in_flight: HashMap<u32, SlotHandle>,
    request_ids: IdAllocator,
    channels: HashSet<u32>,
    created_at: Instant,
    connected_at: Option<Instant>,
    last_received: Instant,
    echo_sent_at: Option<Instant>,
    consecutive_buffered: usize,
    events_off: bool,
    /// Flush what is queued, then close
    closing: bool,
}

#[derive(Debug)]
pub struct Circuit {
    address: SocketAddr,
    /// Minor version the server reported when it answered a search
    search_version: u16,
    backlog_limit: usize,
    inner: Mutex<CircuitInner>,
    outgoing: Notify,
    cancel: CancellationToken,
}

impl Circuit {
    /// Create a circuit with the identification messages already queued
    pub fn new(
        address: SocketAddr,
        search_version: u16,
        config: &ClientConfig,
        now: Instant,
    ) -> Circuit {
        let circuit = Circuit {
            address,
            search_version,
            backlog_limit: config.send_backlog_limit,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Connecting,
                negotiated_version: None,
                queue: BytesMut::new(),
                in_flight: HashMap::new(),
                request_ids: IdAllocator::default(),
                channels: HashSet::new(),
                created_at: now,
                connected_at: None,
                last_received: now,
                echo_sent_at: None,
                consecutive_buffered: 0,
                events_off: false,
                closing: false,
            }),
            outgoing: Notify::new(),
            cancel: CancellationToken::new(),
        };
        {
            // Identification goes out whatever the backlog limit
            let mut inner = circuit.lock();
            for message in [
                Message::Version(Version::default()),
                Message::ClientName(ClientName {
                    name: config.client_name.clone(),
                }),
                Message::HostName(HostName {
                    name: config.host_name.clone(),
                }),
            ] {
                if let Err(e) = message.to_raw().write(&mut (&mut inner.queue).writer()) {
                    warn!("Could not queue identification for {}: {e}", circuit.address);
                }
            }
        }
        circuit.outgoing.notify_one();
        circuit
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn negotiated_version(&self) -> Option<u16> {
        self.lock().negotiated_version
    }

    /// The version to frame requests for: negotiated, or assumed from the search
    pub fn effective_version(&self) -> u16 {
        self.lock()
            .negotiated_version
            .unwrap_or(self.search_version)
    }

    /// Record that the TCP connection is up. Returns false if the circuit
    /// was no longer waiting for it.
    pub fn set_connected(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.state != CircuitState::Connecting {
            return false;
        }
        inner.state = CircuitState::Connected;
        inner.connected_at = Some(now);
        inner.last_received = now;
        true
    }

    /// Handle the server's VERSION message
    pub fn negotiate(&self, server_version: u16) -> Result<u16, ClientError> {
        if server_version < MINIMUM_MINOR_VERSION {
            return Err(ClientError::ProtocolVersionMismatch(server_version));
        }
        let version = server_version.min(CLIENT_MINOR_VERSION);
        debug!(
            "Circuit {} negotiated minor version {version} (server {server_version})",
            self.address
        );
        self.lock().negotiated_version = Some(version);
        Ok(version)
    }

    /// Fall back to the version from the search reply, if nothing was negotiated
    pub fn assume_search_version(&self) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if inner.negotiated_version.is_none() {
            if self.search_version < MINIMUM_MINOR_VERSION {
                return Err(ClientError::ProtocolVersionMismatch(self.search_version));
            }
            debug!(
                "No VERSION from {}, assuming minor version {}",
                self.address, self.search_version
            );
            inner.negotiated_version = Some(self.search_version.min(CLIENT_MINOR_VERSION));
        }
        Ok(())
    }

    /// Has the server failed to say which version it speaks in time?
    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        let inner = self.lock();
        inner.negotiated_version.is_none()
            && inner
                .connected_at
                .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
    }

    /// Has the TCP connection been pending for too long?
    pub fn connect_expired(&self, now: Instant, timeout: Duration) -> bool {
        let inner = self.lock();
        inner.state == CircuitState::Connecting
            && now.saturating_duration_since(inner.created_at) >= timeout
    }

    fn enqueue(&self, inner: &mut CircuitInner, raw: RawMessage) -> Result<(), ClientError> {
        if inner.state == CircuitState::Disconnected {
            return Err(ClientError::Disconnected);
        }
        if raw.is_extended() {
            let version = inner.negotiated_version.unwrap_or(self.search_version);
            if version < EXTENDED_HEADER_MINOR_VERSION {
                return Err(ClientError::InvalidUsage(format!(
                    "Message of {} bytes is too large for a minor version {version} server",
                    raw.payload.len()
                )));
            }
        }
        let size = raw.encoded_len();
        if inner.queue.len() + size > self.backlog_limit {
            warn!(
                "Send backlog to {} would reach {} bytes",
                self.address,
                inner.queue.len() + size
            );
            return Err(ClientError::BackpressureExceeded {
                limit: self.backlog_limit,
            });
        }
        trace!("Queueing command {} for {}", raw.header.command, self.address);
        raw.write(&mut (&mut inner.queue).writer())?;
        self.outgoing.notify_one();
        Ok(())
    }

    /// Queue a message for sending
    pub fn send(&self, message: impl Into<Message>) -> Result<(), ClientError> {
        let raw = message.into().to_raw();
        let mut inner = self.lock();
        self.enqueue(&mut inner, raw)
    }

    /// Everything queued so far, in order
    pub fn take_outgoing(&self) -> Option<Bytes> {
        let mut inner = self.lock();
        if inner.queue.is_empty() {
            None
        } else {
            Some(inner.queue.split().freeze())
        }
    }

    pub fn queued_bytes(&self) -> usize {
        self.lock().queue.len()
    }

    /// Wait until something is queued
    pub async fn outgoing_ready(&self) {
        self.outgoing.notified().await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Give a request a fresh id on this circuit
    pub fn register(&self, handle: SlotHandle) -> u32 {
        let mut inner = self.lock();
        let CircuitInner {
            in_flight,
            request_ids,
            ..
        } = &mut *inner;
        let ioid = request_ids.allocate(|id| in_flight.contains_key(&id));
        in_flight.insert(ioid, handle);
        ioid
    }

    pub fn lookup(&self, ioid: u32) -> Option<SlotHandle> {
        self.lock().in_flight.get(&ioid).copied()
    }

    /// Remove a request id, handing back what it referred to
    pub fn complete(&self, ioid: u32) -> Option<SlotHandle> {
        self.lock().in_flight.remove(&ioid)
    }

    pub fn in_flight(&self) -> Vec<(u32, SlotHandle)> {
        self.lock()
            .in_flight
            .iter()
            .map(|(id, handle)| (*id, *handle))
            .collect()
    }

    pub fn claim(&self, cid: u32) {
        self.lock().channels.insert(cid);
    }

    /// Remove a channel. Returns true if no channels remain.
    pub fn unclaim(&self, cid: u32) -> bool {
        let mut inner = self.lock();
        inner.channels.remove(&cid);
        inner.channels.is_empty()
    }

    pub fn has_channel(&self, cid: u32) -> bool {
        self.lock().channels.contains(&cid)
    }

    pub fn channels(&self) -> Vec<u32> {
        self.lock().channels.iter().copied().collect()
    }

    /// Take the circuit down. Only the first call does anything.
    pub fn teardown(&self) -> Option<TeardownSummary> {
        let mut inner = self.lock();
        if inner.state == CircuitState::Disconnected {
            return None;
        }
        inner.state = CircuitState::Disconnected;
        inner.queue.clear();
        let summary = TeardownSummary {
            in_flight: inner.in_flight.drain().collect(),
            channels: inner.channels.drain().collect(),
        };
        self.cancel.cancel();
        self.outgoing.notify_one();
        Some(summary)
    }

    /// Close once everything already queued has been written
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::Disconnected {
            return;
        }
        debug!("Closing unused circuit to {}", self.address);
        let never_connected = inner.state == CircuitState::Connecting;
        inner.state = CircuitState::Disconnected;
        inner.closing = true;
        if never_connected {
            self.cancel.cancel();
        }
        self.outgoing.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    /// Note traffic from the server
    pub fn note_received(&self, now: Instant) {
        let mut inner = self.lock();
        inner.last_received = now;
        inner.echo_sent_at = None;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock().last_received)
    }

    /// Judge the circuit by how long it has been silent. After `period`
    /// without traffic it should be sent an echo, and `period` after an
    /// unanswered echo it is considered dead.
    pub fn liveness(&self, now: Instant, period: Duration) -> Liveness {
        let inner = self.lock();
        if inner.state != CircuitState::Connected {
            return Liveness::Alive;
        }
        match inner.echo_sent_at {
            Some(sent) if now.saturating_duration_since(sent) >= period => Liveness::Unresponsive,
            Some(_) => Liveness::Alive,
            None if now.saturating_duration_since(inner.last_received) >= period => {
                Liveness::Quiet
            }
            None => Liveness::Alive,
        }
    }

    /// Send an echo unless one is already awaiting its reply
    pub fn send_echo(&self, now: Instant) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Connected || inner.echo_sent_at.is_some() {
            return Ok(());
        }
        trace!("Sending echo on circuit {}", self.address);
        self.enqueue(&mut inner, Message::Echo.to_raw())?;
        inner.echo_sent_at = Some(now);
        Ok(())
    }

    /// Receive flow control. Called by the reader after each message with
    /// whether more data was already waiting; a long enough run of those asks
    /// the server to pause subscription updates until the reader catches up.
    pub fn receive_backlog(&self, buffered: bool, threshold: usize) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if buffered {
            inner.consecutive_buffered += 1;
            if inner.consecutive_buffered >= threshold && !inner.events_off {
                debug!("Receive backlog on {}, pausing events", self.address);
                self.enqueue(&mut inner, Message::EventsOff.to_raw())?;
                inner.events_off = true;
            }
        } else {
            inner.consecutive_buffered = 0;
            if inner.events_off {
                debug!("Receive backlog on {} cleared, resuming events", self.address);
                self.enqueue(&mut inner, Message::EventsOn.to_raw())?;
                inner.events_off = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::pool::{CompletionPool, SizeClass},
        messages::Message,
    };

    fn config(backlog: usize) -> ClientConfig {
        ClientConfig::builder()
            .search_addresses(Vec::new())
            .send_backlog_limit(backlog)
            .client_name("tester")
            .host_name("testhost")
            .build()
    }

    fn circuit(backlog: usize) -> Circuit {
        Circuit::new(
            "127.0.0.1:5064".parse().unwrap(),
            13,
            &config(backlog),
            Instant::now(),
        )
    }

    #[test]
    fn identification_is_queued_first() {
        let circuit = circuit(4096);
        circuit.send(Message::Echo).unwrap();
        let bytes = circuit.take_outgoing().unwrap();
        let messages = Message::parse_many(&bytes).unwrap();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], Message::Version(_)));
        assert!(matches!(&messages[1], Message::ClientName(c) if c.name == "tester"));
        assert!(matches!(&messages[2], Message::HostName(h) if h.name == "testhost"));
        assert_eq!(messages[3], Message::Echo);
        assert!(circuit.take_outgoing().is_none());
    }

    #[test]
    fn backlog_limit_is_enforced() {
        let circuit = circuit(128);
        circuit.take_outgoing();
        let mut sent = 0;
        let error = loop {
            match circuit.send(Message::Echo) {
                Ok(()) => sent += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(sent, 8);
        assert!(matches!(error, ClientError::BackpressureExceeded { limit: 128 }));
        // Draining makes room again
        circuit.take_outgoing();
        assert!(circuit.send(Message::Echo).is_ok());
    }

    #[test]
    fn identification_ignores_tiny_backlog() {
        let circuit = circuit(8);
        assert!(circuit.queued_bytes() > 8);
        assert!(matches!(
            circuit.send(Message::Echo),
            Err(ClientError::BackpressureExceeded { limit: 8 })
        ));
        let bytes = circuit.take_outgoing().unwrap();
        let messages = Message::parse_many(&bytes).unwrap();
        assert!(matches!(
            messages.as_slice(),
            [Message::Version(_), Message::ClientName(_), Message::HostName(_)]
        ));
        assert!(circuit.send(Message::Echo).is_err());
    }

    #[test]
    fn request_ids_are_unique() {
        let circuit = circuit(4096);
        let pool = CompletionPool::new();
        let mut ids = HashSet::new();
        for i in 0..100 {
            let handle = pool.allocate(SizeClass::Notify, i);
            assert!(ids.insert(circuit.register(handle)));
        }
        let (first, handle) = circuit.in_flight()[0];
        assert_eq!(circuit.lookup(first), Some(handle));
        assert_eq!(circuit.complete(first), Some(handle));
        assert_eq!(circuit.lookup(first), None);
    }

    #[test]
    fn teardown_is_idempotent() {
        let circuit = circuit(4096);
        let pool = CompletionPool::new();
        circuit.set_connected(Instant::now());
        circuit.claim(4);
        let ioid = circuit.register(pool.allocate(SizeClass::Notify, ()));
        let token = circuit.cancel_token();

        let summary = circuit.teardown().unwrap();
        assert_eq!(summary.channels, vec![4]);
        assert_eq!(summary.in_flight.len(), 1);
        assert_eq!(summary.in_flight[0].0, ioid);
        assert!(token.is_cancelled());
        assert_eq!(circuit.state(), CircuitState::Disconnected);

        assert!(circuit.teardown().is_none());
        assert!(matches!(circuit.send(Message::Echo), Err(ClientError::Disconnected)));
    }

    #[test]
    fn version_negotiation() {
        let circuit = circuit(4096);
        assert_eq!(circuit.effective_version(), 13);
        assert_eq!(circuit.negotiate(11).unwrap(), 11);
        assert_eq!(circuit.negotiate(20).unwrap(), CLIENT_MINOR_VERSION);
        assert!(matches!(
            circuit.negotiate(3),
            Err(ClientError::ProtocolVersionMismatch(3))
        ));

        let old = Circuit::new(
            "127.0.0.1:5064".parse().unwrap(),
            8,
            &config(1 << 20),
            Instant::now(),
        );
        let now = Instant::now();
        old.set_connected(now);
        assert!(!old.handshake_expired(now, Duration::from_secs(5)));
        assert!(old.handshake_expired(now + Duration::from_secs(5), Duration::from_secs(5)));
        old.assume_search_version().unwrap();
        assert_eq!(old.negotiated_version(), Some(8));
        // Version 8 cannot carry the large header
        let big = Message::Write(crate::messages::Write {
            data_type: crate::dbr::DbrType::try_from(6).unwrap(),
            data_count: 10000,
            server_id: 1,
            client_ioid: 1,
            data: vec![0; 80000],
        });
        assert!(matches!(old.send(big), Err(ClientError::InvalidUsage(_))));
    }

    #[test]
    fn echo_liveness() {
        let circuit = circuit(4096);
        let start = Instant::now();
        let period = Duration::from_secs(15);
        assert_eq!(circuit.liveness(start, period), Liveness::Alive);
        circuit.set_connected(start);
        circuit.take_outgoing();
        assert_eq!(circuit.liveness(start + period, period), Liveness::Quiet);
        circuit.send_echo(start + period).unwrap();
        // A second echo while the first is unanswered sends nothing more
        circuit.send_echo(start + period).unwrap();
        let sent = Message::parse_many(&circuit.take_outgoing().unwrap()).unwrap();
        assert_eq!(sent, vec![Message::Echo]);
        assert_eq!(circuit.liveness(start + period * 2, period), Liveness::Unresponsive);
        circuit.note_received(start + period * 2);
        assert_eq!(circuit.liveness(start + period * 2, period), Liveness::Alive);
    }

    #[test]
    fn flow_control_toggles_events() {
        let circuit = circuit(4096);
        circuit.set_connected(Instant::now());
        circuit.take_outgoing();
        for _ in 0..3 {
            circuit.receive_backlog(true, 3).unwrap();
        }
        circuit.receive_backlog(true, 3).unwrap();
        circuit.receive_backlog(false, 3).unwrap();
        circuit.receive_backlog(false, 3).unwrap();
        let sent = Message::parse_many(&circuit.take_outgoing().unwrap()).unwrap();
        assert_eq!(sent, vec![Message::EventsOff, Message::EventsOn]);
    }

    #[test]
    fn close_waits_for_flush() {
        let circuit = circuit(4096);
        circuit.set_connected(Instant::now());
        circuit.close();
        assert!(circuit.is_closing());
        assert!(!circuit.cancel_token().is_cancelled());
        assert!(circuit.take_outgoing().is_some());
        assert!(circuit.teardown().is_none());
    }
}
