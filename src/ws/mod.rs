//! Channel infrastructure and connection lifecycle.
//!
//! # Architecture
//!
//! - [`Channel`]: send + event registration + readiness probe, implemented once per
//!   socket type
//! - [`ReconnectionManager`]: owns one logical connection: connect timeout, attempt
//!   counting and a single debounced retry timer
//! - [`Supervisor`]: wires each channel's close event back into the manager so the
//!   caller does not have to
//! - [`memory::MemoryChannel`]: in-process channel pair
//! - [`socket::WebSocketChannel`]: `tokio-tungstenite` channel (feature `ws`)
//!
//! # Example
//!
//! ```ignore
//! let manager = ReconnectionManager::new(config, create_socket, register_handlers)?;
//! let channel = manager.initiate_connection().await?;
//!
//! // later, when the channel reports a close
//! let retry = manager.clone();
//! manager.handle_disconnect(move || async move {
//!     drop(retry.initiate_connection().await);
//! });
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
#[cfg(feature = "ws")]
pub mod socket;
pub mod supervisor;
pub mod traits;

pub use connection::{ConnectionAttempt, ConnectionState, DisconnectOutcome, ReconnectionManager};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use supervisor::Supervisor;
pub use traits::*;
