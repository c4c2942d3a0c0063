// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Serialization
//!
//! Consumers and the producer only see the [`MessageSerializer`] trait. The JSON
//! implementation resolves concrete types through a [`MessageTypeRegistry`] populated
//! by explicit `register::<M>()` calls.

use crate::{errors::AmqpError, message::Message};
use parking_lot::RwLock;
use std::{any::Any, collections::HashMap, sync::Arc};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A deserialized message whose concrete type is known only to the registry.
pub type AnyMessage = Box<dyn Any + Send + Sync>;

/// Serialized payload with the content type it was encoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// Encodes and decodes messages for the wire.
pub trait MessageSerializer: Send + Sync {
    fn serialize(
        &self,
        message_type: &str,
        message: &(dyn Any + Send + Sync),
    ) -> Result<SerializedMessage, AmqpError>;

    fn deserialize(
        &self,
        payload: &[u8],
        message_type: &str,
        content_type: &str,
    ) -> Result<AnyMessage, AmqpError>;
}

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>, AmqpError>;
type DecodeFn = fn(&[u8]) -> Result<AnyMessage, AmqpError>;

#[derive(Clone, Copy)]
struct MessageCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_json<M: Message>(message: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, AmqpError> {
    let message = message
        .downcast_ref::<M>()
        .ok_or_else(|| AmqpError::UnknownMessageType(M::message_type()))?;

    serde_json::to_vec(message).map_err(|err| AmqpError::SerializationError(err.to_string()))
}

fn decode_json<M: Message>(payload: &[u8]) -> Result<AnyMessage, AmqpError> {
    let message: M = serde_json::from_slice(payload)
        .map_err(|err| AmqpError::DeserializationError(err.to_string()))?;

    Ok(Box::new(message))
}

/// Maps message type names to their codec functions.
#[derive(Clone, Default)]
pub struct MessageTypeRegistry {
    codecs: HashMap<String, MessageCodec>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `M` under `M::message_type()`. Registering twice is harmless.
    pub fn register<M: Message>(&mut self) -> &mut Self {
        self.codecs.insert(
            M::message_type(),
            MessageCodec {
                encode: encode_json::<M>,
                decode: decode_json::<M>,
            },
        );
        self
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.codecs.contains_key(message_type)
    }

    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.codecs.keys().cloned().collect();
        types.sort();
        types
    }

    fn codec(&self, message_type: &str) -> Result<MessageCodec, AmqpError> {
        self.codecs
            .get(message_type)
            .copied()
            .ok_or_else(|| AmqpError::UnknownMessageType(message_type.to_owned()))
    }
}

/// JSON serializer backed by a [`MessageTypeRegistry`].
///
/// Types can still be registered after construction, which the bus does for
/// consumers attached at runtime.
#[derive(Default)]
pub struct JsonMessageSerializer {
    registry: RwLock<MessageTypeRegistry>,
}

impl JsonMessageSerializer {
    pub fn new(registry: MessageTypeRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(registry),
        })
    }

    pub fn register<M: Message>(&self) {
        self.registry.write().register::<M>();
    }

    pub fn message_types(&self) -> Vec<String> {
        self.registry.read().message_types()
    }
}

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(
        &self,
        message_type: &str,
        message: &(dyn Any + Send + Sync),
    ) -> Result<SerializedMessage, AmqpError> {
        let codec = self.registry.read().codec(message_type)?;

        Ok(SerializedMessage {
            payload: (codec.encode)(message)?,
            content_type: JSON_CONTENT_TYPE.to_owned(),
        })
    }

    fn deserialize(
        &self,
        payload: &[u8],
        message_type: &str,
        content_type: &str,
    ) -> Result<AnyMessage, AmqpError> {
        if !content_type.is_empty() && content_type != JSON_CONTENT_TYPE {
            return Err(AmqpError::DeserializationError(format!(
                "unsupported content type {content_type}"
            )));
        }

        let codec = self.registry.read().codec(message_type)?;
        (codec.decode)(payload)
    }
}
