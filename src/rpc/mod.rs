//! RPC transport adapter.
//!
//! Binds a raw message channel to an RPC engine. The engine owns call dispatch and
//! request/response correlation; this module only provides what it needs to move
//! payloads across the channel:
//!
//! - [`RpcOptions::post`] / [`RpcOptions::on`]: plumbing onto the channel's send and
//!   `message` event capabilities
//! - [`RpcOptions::serialize`] / [`RpcOptions::deserialize`]: a cycle-safe text codec
//!   that normalizes error values into plain objects
//! - [`RpcSettings`]: timeout and event names passed through to the engine
//!
//! # Example
//!
//! ```ignore
//! let options = create_rpc_options(RpcTransportConfig::for_channel(&channel));
//! options.on(|text| {
//!     let payload = deserialize(text)?;
//!     // hand payload to the RPC engine
//! });
//! options.post(options.serialize(&Value::from("hello"))?)?;
//! ```

pub mod codec;
pub mod error;
pub mod options;
pub mod value;

pub use codec::{deserialize, serialize};
pub use error::CodecError;
pub use options::{RpcOptions, RpcSettings, RpcTimeout, RpcTransportConfig, create_rpc_options};
pub use value::{ErrorValue, MAX_JSON_DEPTH, Map, Node, Value};
