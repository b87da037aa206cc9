//! The control plane of the page engine.
//!
//! Clients use it for the rare, expensive operations: registering themselves, registering a
//! journal to receive a comm slot, querying the engine clock and saying good bye. Page requests
//! never travel here, they go through the comm table of `paged-comm`.
//!
//! The engine binds a [`Dispatcher`] at a well-known socket path and runs it on a dedicated
//! thread. Each exchange is one connection carrying exactly one request and one reply; requests
//! are handled strictly one after another while holding the registry mutex that the engine's
//! allocator shares.
//!
//! ```no_run
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use paged_socket::{ClientGrant, Dispatcher, Registry, RegistryError};
//!
//! struct Refuse;
//!
//! impl Registry for Refuse {
//!     fn register_client(&mut self, _: &str, _: u32, _: bool) -> Result<ClientGrant, RegistryError> {
//!         Err(RegistryError::Refused("closed".into()))
//!     }
//!     fn register_journal(&mut self, _: &str, _: u32) -> Result<usize, RegistryError> {
//!         Err(RegistryError::NoFreeSlot)
//!     }
//!     fn exit_client(&mut self, _: &str, _: u32) {}
//! }
//!
//! let dispatcher = Dispatcher::bind(paged_socket::DEFAULT_SOCKET_PATH, Arc::new(Mutex::new(Refuse)))?;
//! let stop = dispatcher.stop_handle();
//! std::thread::spawn(move || dispatcher.run());
//! // ..
//! stop.stop();
//! # Ok::<(), std::io::Error>(())
//! ```
mod clock;
mod dispatcher;
pub mod protocol;
mod registry;
mod transport;

pub use clock::{Clock, SystemClock};
pub use dispatcher::{Dispatcher, RequestHandler, StopHandle};
pub use protocol::{ProtocolError, Reply, Request, RequestType};
pub use registry::{ClientGrant, Registry, RegistryError};
pub use transport::{Transport, TransportConfig, TransportError, UnixTransport};

/// Upper bound of every message on the control plane, in either direction.
pub const MESSAGE_MAX_LENGTH: usize = 1024;

/// Where the engine listens unless configured otherwise.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/paged/paged.sock";
