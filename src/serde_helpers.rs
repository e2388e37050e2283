//! Serde helpers for the RPC settings wire representation.

use std::time::Duration;

use crate::rpc::RpcTimeout;

/// Wire value for an unbounded RPC timeout.
pub const UNBOUNDED_TIMEOUT_MILLIS: i64 = -1;

/// A `serde_as` type that (de)serializes an [`RpcTimeout`] as integer milliseconds.
///
/// `-1` (or any negative value, when reading) means unbounded.
pub struct TimeoutMillis;

impl serde_with::SerializeAs<RpcTimeout> for TimeoutMillis {
    fn serialize_as<S>(source: &RpcTimeout, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(source.as_millis())
    }
}

impl<'de> serde_with::DeserializeAs<'de, RpcTimeout> for TimeoutMillis {
    fn deserialize_as<D>(deserializer: D) -> std::result::Result<RpcTimeout, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let millis = <i64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(timeout_from_millis(millis))
    }
}

pub(crate) fn timeout_from_millis(millis: i64) -> RpcTimeout {
    match u64::try_from(millis) {
        Ok(millis) => RpcTimeout::Bounded(Duration::from_millis(millis)),
        Err(_) => RpcTimeout::Unbounded,
    }
}
