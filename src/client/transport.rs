//! Socket plumbing behind a [`ClientContext`].
//!
//! [`TokioTransport`] runs one task per circuit plus three background tasks:
//! the UDP searcher, the beacon listener and a watchdog that drives timeouts.
//! All protocol decisions stay in the context; the tasks only move bytes and
//! report what happened.

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    select,
    sync::Notify,
    time::MissedTickBehavior,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, error, trace, warn};

use crate::{
    client::{
        ClientError,
        circuit::Circuit,
        context::{ClientContext, WeakContext},
    },
    config::ClientConfig,
    messages::{CircuitCodec, ClientMessage, MINIMUM_MINOR_VERSION, parse_datagram},
    utils::new_reusable_udp_socket,
};

/// Longest the searcher sleeps when nothing is being searched for
const IDLE_SEARCH_WAKE: Duration = Duration::from_secs(60);

/// The sockets a [`ClientContext`] drives
pub trait Transport: Send + Sync {
    /// Open the TCP connection for a new circuit, and service it until the
    /// circuit's cancellation token fires.
    fn connect(&self, context: WeakContext, circuit: Arc<Circuit>);
    /// There are new searches to send
    fn wake_search(&self);
    /// Stop every task
    fn shutdown(&self) {}
}

pub struct TokioTransport {
    runtime: Handle,
    connection_timeout: Duration,
    max_payload_size: u32,
    search_wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl TokioTransport {
    /// Create a transport spawning onto the current tokio runtime
    pub fn new(config: &ClientConfig) -> io::Result<Self> {
        Ok(TokioTransport {
            runtime: Handle::try_current().map_err(io::Error::other)?,
            connection_timeout: config.connection_timeout,
            max_payload_size: config.max_payload_size(),
            search_wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Bind the search and beacon sockets and start the background tasks
    pub async fn start(&self, context: &ClientContext) -> io::Result<()> {
        let config = context.config();
        let search_socket = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).await?;
        search_socket.set_broadcast(true)?;
        debug!(
            "Searching from {} to {:?}",
            search_socket.local_addr()?,
            config.search_addresses
        );
        self.runtime.spawn(search_task(
            context.downgrade(),
            search_socket,
            self.search_wake.clone(),
            self.cancel.clone(),
        ));

        let beacon_address = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.beacon_port);
        match new_reusable_udp_socket(beacon_address) {
            Ok(socket) => {
                self.runtime
                    .spawn(beacon_task(context.downgrade(), socket, self.cancel.clone()));
            }
            Err(e) => warn!(
                "Failed to listen for beacons on port {}, will run without: {e}",
                config.beacon_port
            ),
        }

        let tick = (config.connection_timeout / 8)
            .clamp(Duration::from_millis(50), Duration::from_secs(1));
        self.runtime
            .spawn(watchdog_task(context.downgrade(), tick, self.cancel.clone()));
        Ok(())
    }
}

impl Transport for TokioTransport {
    fn connect(&self, context: WeakContext, circuit: Arc<Circuit>) {
        let shutdown = self.cancel.clone();
        let timeout = self.connection_timeout;
        let max_payload_size = self.max_payload_size;
        self.runtime.spawn(async move {
            let cancel = circuit.cancel_token();
            select! {
                _ = shutdown.cancelled() => cancel.cancel(),
                _ = circuit_task(context, circuit.clone(), timeout, max_payload_size) => (),
            }
        });
    }

    fn wake_search(&self) {
        self.search_wake.notify_one();
    }

    fn shutdown(&self) {
        debug!("Stopping transport tasks");
        self.cancel.cancel();
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn report_failure(context: &WeakContext, circuit: &Arc<Circuit>, error: ClientError) {
    if let Some(context) = context.upgrade() {
        context.circuit_failed(circuit, error);
    }
}

async fn circuit_task(
    context: WeakContext,
    circuit: Arc<Circuit>,
    timeout: Duration,
    max_payload_size: u32,
) {
    let address = circuit.address();
    let cancel = circuit.cancel_token();
    debug!("Connecting circuit to {address}");
    let stream = select! {
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(timeout, TcpStream::connect(address)) => result,
    };
    let stream = match stream {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Could not connect to {address}: {e}");
            report_failure(&context, &circuit, e.into());
            return;
        }
        Err(_) => {
            warn!("Timed out connecting to {address}");
            report_failure(&context, &circuit, ClientError::Timeout);
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY on {address}: {e}");
    }
    match context.upgrade() {
        Some(ctx) => ctx.circuit_connected(&circuit),
        None => return,
    }

    let (rx, tx) = stream.into_split();
    let writer = tokio::spawn(write_circuit(context.clone(), circuit.clone(), tx));
    read_circuit(context, circuit.clone(), rx, max_payload_size).await;
    cancel.cancel();
    let _ = writer.await;
    debug!("Circuit to {address} finished");
}

async fn read_circuit(
    context: WeakContext,
    circuit: Arc<Circuit>,
    rx: OwnedReadHalf,
    max_payload_size: u32,
) {
    let cancel = circuit.cancel_token();
    let mut framed = FramedRead::with_capacity(rx, CircuitCodec::new(max_payload_size), 16384usize);
    loop {
        let incoming = select! {
            _ = cancel.cancelled() => break,
            incoming = framed.next() => incoming,
        };
        let Some(ctx) = context.upgrade() else {
            break;
        };
        match incoming {
            Some(Ok(message)) => {
                ctx.circuit_message(&circuit, message);
                ctx.circuit_receive_backlog(&circuit, !framed.read_buffer().is_empty());
            }
            Some(Err(e)) => {
                error!("Error reading from {}: {e}", circuit.address());
                ctx.circuit_failed(&circuit, e.into());
                break;
            }
            None => {
                debug!("Server {} closed the connection", circuit.address());
                ctx.circuit_failed(&circuit, ClientError::Disconnected);
                break;
            }
        }
    }
}

async fn write_circuit(context: WeakContext, circuit: Arc<Circuit>, mut tx: OwnedWriteHalf) {
    let cancel = circuit.cancel_token();
    loop {
        while let Some(bytes) = circuit.take_outgoing() {
            trace!("Writing {} bytes to {}", bytes.len(), circuit.address());
            if let Err(e) = tx.write_all(&bytes).await {
                error!("Failed to write to {}: {e}", circuit.address());
                report_failure(&context, &circuit, e.into());
                return;
            }
        }
        if circuit.is_closing() {
            let _ = tx.shutdown().await;
            cancel.cancel();
            return;
        }
        select! {
            _ = cancel.cancelled() => return,
            _ = circuit.outgoing_ready() => (),
        }
    }
}

/// Hand the search replies in a datagram to the context
fn handle_search_datagram(context: &ClientContext, data: &[u8], source: SocketAddr) {
    let messages = match parse_datagram(data) {
        Ok(messages) => messages,
        Err(e) => {
            debug!("Ignoring malformed datagram from {source}: {e}");
            return;
        }
    };
    // Replies without their own version inherit the datagram's
    let mut version = MINIMUM_MINOR_VERSION;
    for message in messages {
        match message {
            ClientMessage::Version(v) => version = v.protocol_version,
            ClientMessage::SearchResponse(reply) => {
                let ip = reply.server_ip.map(IpAddr::V4).unwrap_or(source.ip());
                context.search_reply(
                    reply.search_id,
                    SocketAddr::new(ip, reply.port_number),
                    reply.protocol_version.unwrap_or(version),
                );
            }
            other => trace!("Ignoring {other:?} from {source}"),
        }
    }
}

async fn search_task(
    context: WeakContext,
    socket: UdpSocket,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        let Some(ctx) = context.upgrade() else {
            break;
        };
        let now = Instant::now();
        let (datagrams, deadline) = ctx.poll_search(now);
        let addresses = ctx.config().search_addresses.clone();
        drop(ctx);
        for datagram in &datagrams {
            for address in &addresses {
                if let Err(e) = socket.send_to(datagram, address).await {
                    warn!("Failed to send search to {address}: {e}");
                }
            }
        }
        let deadline = deadline.unwrap_or(now + IDLE_SEARCH_WAKE);
        select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => (),
            _ = tokio::time::sleep_until(deadline.into()) => (),
            result = socket.recv_from(&mut buffer) => match result {
                Ok((size, source)) => {
                    let Some(ctx) = context.upgrade() else {
                        break;
                    };
                    handle_search_datagram(&ctx, &buffer[..size], source);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                // ICMP port-unreachable from a previous send shows up here on some platforms
                Err(e) => debug!("Error receiving search replies: {e}"),
            }
        }
    }
    debug!("Search task finished");
}

async fn beacon_task(context: WeakContext, socket: UdpSocket, cancel: CancellationToken) {
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        let (size, source) = select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Got unresumable error whilst watching beacons: {e}");
                    break;
                }
            }
        };
        let Some(ctx) = context.upgrade() else {
            break;
        };
        let Ok(messages) = parse_datagram(&buffer[..size]) else {
            continue;
        };
        for message in messages {
            if let ClientMessage::RsrvIsUp(beacon) = message {
                trace!("Observed beacon: {beacon:?}");
                let ip = beacon.server_ip.map(IpAddr::V4).unwrap_or(source.ip());
                ctx.beacon(
                    SocketAddr::new(ip, beacon.server_port),
                    beacon.beacon_id,
                    beacon.protocol_version,
                );
            }
        }
    }
    debug!("Beacon task finished");
}

async fn watchdog_task(context: WeakContext, tick: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(ctx) = context.upgrade() else {
                    break;
                };
                ctx.check_liveness(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AsBytes, Message, RsrvIsUp, SearchResponse, Version};

    #[derive(Default)]
    struct NullTransport;

    impl Transport for NullTransport {
        fn connect(&self, _context: WeakContext, _circuit: Arc<Circuit>) {}
        fn wake_search(&self) {}
    }

    fn context() -> ClientContext {
        ClientContext::new(
            ClientConfig::builder().search_addresses(Vec::new()).build(),
            Arc::new(NullTransport),
        )
    }

    #[test]
    fn search_reply_address_comes_from_datagram() {
        let context = context();
        let cid = context.create_channel("A", None).unwrap();
        let (datagrams, _) = context.poll_search(Instant::now());
        let Message::Search(search) = &Message::parse_many(&datagrams[0]).unwrap()[1] else {
            panic!("Expected a search");
        };
        let mut reply = Version::default().as_bytes();
        reply.extend(
            SearchResponse {
                port_number: 6000,
                search_id: search.search_id,
                server_ip: None,
                protocol_version: Some(13),
            }
            .as_bytes(),
        );
        handle_search_datagram(&context, &reply, "192.168.1.5:5064".parse().unwrap());
        assert_eq!(context.circuit_count(), 1);
        assert_eq!(
            context.channel_state(cid),
            Some(crate::client::ChannelState::Connecting)
        );
        // A second copy of the same reply changes nothing
        handle_search_datagram(&context, &reply, "192.168.1.6:5064".parse().unwrap());
        assert_eq!(context.circuit_count(), 1);
    }

    #[test]
    fn junk_datagrams_are_ignored() {
        let context = context();
        handle_search_datagram(&context, &[1, 2, 3], "10.0.0.1:5064".parse().unwrap());
        let beacon = RsrvIsUp {
            server_port: 5064,
            beacon_id: 1,
            server_ip: None,
            protocol_version: 13,
        };
        // Beacons arriving on the search socket are not search replies
        handle_search_datagram(&context, &beacon.as_bytes(), "10.0.0.1:5064".parse().unwrap());
        assert_eq!(context.circuit_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_tasks() {
        let config = ClientConfig::builder().search_addresses(Vec::new()).build();
        let transport = TokioTransport::new(&config).unwrap();
        transport.wake_search();
        transport.shutdown();
        assert!(transport.cancel.is_cancelled());
    }
}
