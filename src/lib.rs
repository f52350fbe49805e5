// #![warn(missing_docs)]

//! Rust implementation of the client side of the EPICS CA protocol.
//!
//! This crate is a pure-rust implementation of a client for the [EPICS CA protocol].
//! It does not depend on the C-based [epics-base] project at all.
//!
//! <div class="warning">This is an early version of this library. Interfaces or
//! structure may be changed around between versions until a comfortable final design
//! is settled upon.</div>
//!
//! The crate is split into layers:
//!
//! - Mapping and serialization/deserialization of message types, in module [messages].
//! - Representing data for transferring back and forth (["DBR" types]) via CA in module
//!   [dbr].
//! - A callback-level engine, [`client::ClientContext`], that tracks channels, circuits,
//!   name resolution and outstanding requests without doing any I/O itself.
//! - [`client::TokioTransport`], which moves the engine's bytes over tokio sockets.
//! - [`client::Client`], an async facade with `get`, `put` and `subscribe` by PV name.
//!
//! ## Example
//!
//! Reading a value, and then watching it change:
//!
//! ```no_run
//! use epicars_cac::client::Client;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new().await.unwrap();
//!     let value: i32 = client.get("NUMERIC_VALUE").await.unwrap();
//!     println!("Value is {value}");
//!
//!     let mut monitor = client.subscribe::<i32>("NUMERIC_VALUE").await.unwrap();
//!     while let Ok(value) = monitor.recv().await {
//!         println!("Value is now: {value}");
//!     }
//! }
//! ```
//!
//! ## Current Status of crate
//!
//! What is currently present:
//! - Searching for PVs by UDP broadcast, with backoff, and reacting to server beacons
//!   to find restarted servers quickly.
//! - Sharing one TCP circuit per server between all of its channels, with version
//!   negotiation, flow control, and liveness checks on quiet circuits.
//! - Reads and writes with completion notification, fire-and-forget writes, and
//!   subscriptions that survive the loss and return of a server.
//! - Translating values between different data types upon request, including the
//!   `STS`, `TIME`, `GR` and `CTRL` metadata categories.
//!
//! What this doesn't do:
//! - Act as a server, or talk to a CA repeater. Beacons are received directly.
//! - PVAccess.
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;
pub mod config;
pub mod dbr;
pub mod messages;

mod utils;

pub use crate::client::Client;
pub use crate::config::ClientConfig;
