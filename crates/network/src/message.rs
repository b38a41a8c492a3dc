//! Typed message traits and payload codec

use crate::error::{NetworkError, NetworkResult};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// A message that can travel over the network layer
///
/// The payload codec is ciborium; the `message_type` tag is what the router
/// dispatches on.
pub trait NetworkMessage:
    Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Type tag carried in the transport envelope
    fn message_type() -> &'static str;

    /// Encode the message payload
    fn encode(&self) -> NetworkResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Decode a message payload
    fn decode(bytes: &[u8]) -> NetworkResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| NetworkError::Serialization(e.to_string()))
    }
}

/// A request message bound to a response type, forming a service
pub trait ServiceMessage: NetworkMessage {
    /// The response this request elicits
    type Response: NetworkMessage;

    /// Identifier of the service handling this request
    fn service_id() -> &'static str;
}

/// Envelope type tag for responses to a given service
pub(crate) fn response_type(service_id: &str) -> String {
    format!("{service_id}.reply")
}
