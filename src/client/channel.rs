//! Per-PV channel state.
//!
//! A channel moves `Searching → Connecting → Claimed`, drops back through
//! `Disconnected` to `Searching` whenever the circuit under it goes away, and
//! ends in `Destroyed`. It refers to its circuit only by server address; the
//! context resolves that through its registry.

use std::{fmt, net::SocketAddr, sync::Arc};

use tracing::{debug, warn};

use crate::{
    client::pool::SlotHandle,
    dbr::DbrBasicType,
    messages::{Access, CreateChannelResponse},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Searching,
    /// Claim sent on a circuit, waiting for the server to acknowledge it
    Connecting,
    Claimed,
    Disconnected,
    Destroyed,
}

/// What is known about a claimed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub cid: u32,
    pub native_type: DbrBasicType,
    pub native_count: u32,
    pub access: Access,
    pub server: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ChannelInfo),
    Disconnected,
}

pub type ConnectionHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

pub struct Channel {
    pub name: String,
    pub cid: u32,
    state: ChannelState,
    /// Server the channel is connecting or claimed on
    circuit: Option<SocketAddr>,
    /// Server that last hosted this channel, for reconnecting without a search
    last_server: Option<SocketAddr>,
    server_id: Option<u32>,
    native_type: Option<DbrBasicType>,
    native_count: u32,
    access: Access,
    /// Every live operation issued on this channel
    operations: Vec<SlotHandle>,
    on_connect: Option<ConnectionHandler>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("cid", &self.cid)
            .field("state", &self.state)
            .field("circuit", &self.circuit)
            .field("server_id", &self.server_id)
            .field("operations", &self.operations.len())
            .finish()
    }
}

impl Channel {
    pub fn new(name: &str, cid: u32, on_connect: Option<ConnectionHandler>) -> Self {
        Channel {
            name: name.to_string(),
            cid,
            state: ChannelState::Searching,
            circuit: None,
            last_server: None,
            server_id: None,
            native_type: None,
            native_count: 0,
            access: Access::None,
            operations: Vec::new(),
            on_connect,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn circuit(&self) -> Option<SocketAddr> {
        self.circuit
    }

    pub fn last_server(&self) -> Option<SocketAddr> {
        self.last_server
    }

    pub fn server_id(&self) -> Option<u32> {
        self.server_id
    }

    pub fn native_type(&self) -> Option<DbrBasicType> {
        self.native_type
    }

    pub fn native_count(&self) -> u32 {
        self.native_count
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn on_connect(&self) -> Option<ConnectionHandler> {
        self.on_connect.clone()
    }

    pub fn info(&self) -> Option<ChannelInfo> {
        if self.state != ChannelState::Claimed {
            return None;
        }
        Some(ChannelInfo {
            name: self.name.clone(),
            cid: self.cid,
            native_type: self.native_type?,
            native_count: self.native_count,
            access: self.access,
            server: self.circuit?,
        })
    }

    fn transition(&mut self, to: ChannelState) {
        debug!(
            "Channel '{}' (cid {}): {:?} -> {:?}",
            self.name, self.cid, self.state, to
        );
        self.state = to;
    }

    /// A server has been found; the claim is about to be sent on its circuit
    pub fn connecting(&mut self, server: SocketAddr) -> bool {
        if self.state != ChannelState::Searching {
            warn!(
                "Channel '{}' asked to connect while {:?}",
                self.name, self.state
            );
            return false;
        }
        self.circuit = Some(server);
        self.transition(ChannelState::Connecting);
        true
    }

    /// The server acknowledged the claim
    pub fn claimed(&mut self, response: &CreateChannelResponse) -> bool {
        if self.state != ChannelState::Connecting {
            return false;
        }
        self.server_id = Some(response.server_id);
        self.native_type = Some(response.data_type);
        self.native_count = response.data_count;
        self.last_server = self.circuit;
        self.transition(ChannelState::Claimed);
        true
    }

    pub fn set_access(&mut self, access: Access) {
        debug!("Channel '{}' access is now {access}", self.name);
        self.access = access;
    }

    /// The circuit under the channel is gone
    pub fn disconnected(&mut self) -> bool {
        if !matches!(
            self.state,
            ChannelState::Connecting | ChannelState::Claimed
        ) {
            return false;
        }
        self.circuit = None;
        self.server_id = None;
        self.access = Access::None;
        self.transition(ChannelState::Disconnected);
        true
    }

    /// Go back to looking for a server
    pub fn searching(&mut self) {
        if self.state == ChannelState::Destroyed {
            return;
        }
        self.circuit = None;
        self.server_id = None;
        self.transition(ChannelState::Searching);
    }

    /// The server refused the claim; do not try it again without a search
    pub fn forget_server(&mut self) {
        self.last_server = None;
    }

    pub fn destroyed(&mut self) {
        self.circuit = None;
        self.server_id = None;
        self.transition(ChannelState::Destroyed);
    }

    pub fn add_operation(&mut self, handle: SlotHandle) {
        self.operations.push(handle);
    }

    pub fn remove_operation(&mut self, handle: SlotHandle) {
        self.operations.retain(|h| *h != handle);
    }

    pub fn operations(&self) -> &[SlotHandle] {
        &self.operations
    }

    pub fn take_operations(&mut self) -> Vec<SlotHandle> {
        std::mem::take(&mut self.operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_response(cid: u32) -> CreateChannelResponse {
        CreateChannelResponse {
            data_type: DbrBasicType::Double,
            data_count: 1,
            client_id: cid,
            server_id: 99,
        }
    }

    #[test]
    fn lifecycle() {
        let server: SocketAddr = "10.0.0.2:5064".parse().unwrap();
        let mut channel = Channel::new("TEST:PV", 3, None);
        assert_eq!(channel.state(), ChannelState::Searching);
        assert!(channel.info().is_none());
        // A claim ack before connecting is ignored
        assert!(!channel.claimed(&claim_response(3)));

        assert!(channel.connecting(server));
        assert!(!channel.connecting(server));
        assert!(channel.claimed(&claim_response(3)));
        channel.set_access(Access::ReadWrite);
        let info = channel.info().unwrap();
        assert_eq!(info.native_type, DbrBasicType::Double);
        assert_eq!(info.server, server);
        assert_eq!(info.access, Access::ReadWrite);

        assert!(channel.disconnected());
        assert!(!channel.disconnected());
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(channel.circuit(), None);
        assert_eq!(channel.last_server(), Some(server));
        channel.searching();
        assert_eq!(channel.state(), ChannelState::Searching);

        channel.destroyed();
        channel.searching();
        assert_eq!(channel.state(), ChannelState::Destroyed);
    }

    #[test]
    fn operations_are_tracked() {
        let pool = crate::client::pool::CompletionPool::new();
        let mut channel = Channel::new("A", 1, None);
        let a = pool.allocate(crate::client::pool::SizeClass::Notify, ());
        let b = pool.allocate(crate::client::pool::SizeClass::Subscription, ());
        channel.add_operation(a);
        channel.add_operation(b);
        channel.remove_operation(a);
        assert_eq!(channel.operations(), &[b]);
        assert_eq!(channel.take_operations(), vec![b]);
        assert!(channel.operations().is_empty());
    }
}
