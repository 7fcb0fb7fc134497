//! Event and value codec.
//!
//! Events are `MsgPack` maps with named fields; decoding tolerates unknown
//! fields and missing optional ones. Cached values are marshaled with the
//! same format but are opaque to the event codec itself.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::event::Event;

/// Failure to encode or decode an event or a cached value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode event: {0}")]
    Encode(#[source] rmp_serde::encode::Error),
    #[error("failed to decode event: {0}")]
    Decode(#[source] rmp_serde::decode::Error),
    #[error("failed to marshal value: {0}")]
    MarshalValue(#[source] rmp_serde::encode::Error),
    #[error("failed to unmarshal value as {type_name}: {source}")]
    UnmarshalValue {
        type_name: &'static str,
        #[source]
        source: rmp_serde::decode::Error,
    },
}

/// Encodes an event to its wire bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode(event: &Event) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(event).map_err(CodecError::Encode)
}

/// Decodes an event from wire bytes.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not a valid event.
pub fn decode(bytes: &[u8]) -> Result<Event, CodecError> {
    rmp_serde::from_slice(bytes).map_err(CodecError::Decode)
}

/// Marshals a caller value into the opaque bytes carried in `Event::value`
/// and stored in the remote store.
///
/// # Errors
///
/// Returns [`CodecError::MarshalValue`] if the value cannot be serialized.
pub fn marshal_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(CodecError::MarshalValue)
}

/// Unmarshals bytes produced by [`marshal_value`] back into `T`.
///
/// # Errors
///
/// Returns [`CodecError::UnmarshalValue`] if the bytes do not decode as `T`.
pub fn unmarshal_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|source| CodecError::UnmarshalValue {
        type_name: std::any::type_name::<T>(),
        source,
    })
}
