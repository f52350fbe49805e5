use num::{One, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Bind a UDP socket that other processes on this host may also bind.
///
/// Several CA clients on one machine all listen for beacons on the same port.
pub(crate) fn new_reusable_udp_socket(address: SocketAddr) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + One + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::one());
    id
}

/// Hands out 32-bit ids in increasing order, wrapping around and skipping any
/// id the caller reports as still in use.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn starting_at(next: u32) -> Self {
        IdAllocator { next }
    }

    pub fn allocate<F: Fn(u32) -> bool>(&mut self, in_use: F) -> u32 {
        loop {
            let id = wrapping_inplace_add(&mut self.next);
            if !in_use(id) {
                return id;
            }
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Get the server listen port, either from environment or default 5064
pub fn get_default_server_port() -> u16 {
    env_or("EPICS_CA_SERVER_PORT", 5064u16).max(5000u16)
}

/// Get the beacon broadcast port, either from environment or default 5065
pub fn get_default_beacon_port() -> u16 {
    env_or("EPICS_CA_REPEATER_PORT", 5065u16).max(5000u16)
}

/// Get the target list of broadcast IPs, by reading the environment and interfaces
///
/// Hostnames are resolved if in the environment setting, so this will re-resolve
pub fn get_target_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    // Work out if we want to automatically include all local broadcast
    let use_auto_address = env::var("EPICS_CA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no"))
        .unwrap_or(true);
    if use_auto_address {
        ips.extend(
            datalink::interfaces()
                .into_iter()
                .filter(|i| !i.is_loopback())
                .flat_map(|i| i.ips.into_iter())
                .filter(|i| i.is_ipv4())
                .flat_map(|f| (f.broadcast(), default_search_port).to_socket_addrs())
                .flatten(),
        );
    }
    if let Ok(addr_list) = env::var("EPICS_CA_ADDR_LIST") {
        ips.extend(parse_address_list(&addr_list, default_search_port));
    }
    ips
}

/// Resolve a whitespace-separated list of `host[:port]` entries
pub fn parse_address_list(addr_list: &str, default_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    for add in addr_list.split_ascii_whitespace() {
        let resolved = if add.contains(':') {
            add.to_socket_addrs()
        } else {
            (add, default_port).to_socket_addrs()
        };
        match resolved {
            Ok(addr) => {
                debug!("Adding search IP: {add} => {addr:?}");
                ips.extend(addr.filter(|a| a.is_ipv4()));
            }
            Err(e) => {
                warn!("Failed to convert '{add}' to address: {e}");
            }
        }
    }
    ips
}

pub fn get_default_connection_timeout() -> Duration {
    Duration::from_secs_f32(env_or("EPICS_CA_CONN_TMO", 30.0f32).max(0.1f32))
}

pub fn get_default_max_search_interval() -> Duration {
    Duration::from_secs_f32(env_or("EPICS_CA_MAX_SEARCH_PERIOD", 300.0f32).max(60f32))
}

pub fn get_default_max_array_bytes() -> u32 {
    env_or("EPICS_CA_MAX_ARRAY_BYTES", 16384u32).max(16384u32)
}
