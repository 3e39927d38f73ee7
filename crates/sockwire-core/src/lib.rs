//! sockwire - transport and object-model core of a local display/client IPC protocol.
//!
//! This crate provides the pieces both peers of a connection share:
//! - A fixed-capacity ring buffer producing scatter/gather segments for socket I/O
//! - A signature-driven wire codec with out-of-band file descriptor passing
//! - A per-connection object registry with replacement, destruction and inert semantics
//!
//! On top of the core sit the [`connection::Connection`] transport, the display
//! side ([`server::Display`]) and the client side ([`client::ClientDisplay`]).
//!
//! # Example
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//! use sockwire::client::ClientDisplay;
//! use sockwire::server::Display;
//!
//! let (server_end, client_end) = UnixStream::pair().unwrap();
//! let mut display = Display::new();
//! let client_id = display.add_client(server_end);
//!
//! let mut client = ClientDisplay::connect(client_end);
//! client.sync().unwrap();
//! client.flush().unwrap();
//!
//! display.process_client(client_id).unwrap();
//! client.dispatch().unwrap();
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod server;
pub mod wire;

pub use config::{ConnectionConfig, WireConfig};
pub use error::{ProtocolError, Result, SockwireError};
pub use registry::{ObjectRegistry, ResourceHandle};
pub use ring::RingBuffer;
pub use wire::{Argument, Fixed, Interface, Message, MessageDesc};
