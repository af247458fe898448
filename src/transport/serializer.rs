//! Message serialization for the transport.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::queue::Envelope;

/// Header naming the Rust type carried in the body.
pub const TYPE_HEADER: &str = "type";
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Failure to turn an envelope back into a message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

/// Converts domain messages to and from envelopes.
pub trait Serializer: Send + Sync {
    type Message;

    fn encode(&self, message: &Self::Message) -> crate::error::Result<Envelope>;

    fn decode(&self, envelope: Envelope) -> Result<Self::Message, DecodeError>;
}

/// JSON body with the type name in the headers.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    type Message = T;

    fn encode(&self, message: &T) -> crate::error::Result<Envelope> {
        let body = serde_json::to_string(message)?;
        let headers = BTreeMap::from([
            (TYPE_HEADER.to_string(), Self::type_name().to_string()),
            (CONTENT_TYPE_HEADER.to_string(), "application/json".to_string()),
        ]);
        Ok(Envelope::new(body, headers))
    }

    fn decode(&self, envelope: Envelope) -> Result<T, DecodeError> {
        match envelope.headers.get(TYPE_HEADER) {
            Some(name) if name != Self::type_name() => {
                return Err(DecodeError(format!(
                    "Expected type \"{}\", got \"{}\".",
                    Self::type_name(),
                    name
                )));
            }
            Some(_) => {}
            None => return Err(DecodeError("Encoded envelope should have a \"type\" header.".to_string())),
        }

        serde_json::from_str(&envelope.body).map_err(|e| DecodeError(e.to_string()))
    }
}
