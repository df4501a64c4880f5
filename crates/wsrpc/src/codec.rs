//! MessagePack payload codec used by typed calls and generated stubs.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RpcError;

/// Encode a value as a named-field MessagePack payload.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, RpcError> {
    rmp_serde::to_vec_named(value).map_err(|e| RpcError::Codec(format!("encode: {e}")))
}

/// Decode a MessagePack payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    rmp_serde::from_slice(bytes).map_err(|e| RpcError::Codec(format!("decode: {e}")))
}
