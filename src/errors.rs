// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Bus
//!
//! This module provides the error type shared by every layer of the bus runtime.
//! The `AmqpError` enum represents all failures that can occur during connection,
//! channel, topology declaration, consuming, publishing and message handling.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connectivity failures are reported synchronously by the call that triggered them.
/// `Disconnected` is kept distinct from the other variants because the bus treats it
/// as a recoverable condition that the connection manager heals on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection is currently down and waiting for the recovery loop
    #[error("connection is disconnected")]
    Disconnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a broker-level consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a broker-level consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error stopping a consumer
    #[error("failure to stop consumer `{0}`")]
    ConsumerStopError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error encoding a message payload
    #[error("failure to serialize message `{0}`")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    DeserializationError(String),

    /// The message type was never registered with the serializer
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// A consumer handler or pipeline reported a failure
    #[error("failure to handle message `{0}`")]
    HandlerError(String),

    /// A consumer was registered for a different message type than requested
    #[error("consumer `{0}` does not handle message type `{1}`")]
    ConsumerTypeMismatch(String, String),

    /// Invalid consumer, producer or connection configuration
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// The bus could not start; carries the outcome of stopping what had started
    #[error("failure to start the bus: {source}")]
    StartAborted {
        source: Box<AmqpError>,
        stop: Option<Box<AmqpError>>,
    },
}

impl AmqpError {
    /// Builds a handler error from anything printable.
    pub fn handler<E: ToString>(err: E) -> Self {
        AmqpError::HandlerError(err.to_string())
    }

    /// Whether the error only reports a dropped connection.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, AmqpError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn start_aborted_exposes_original_error_as_source() {
        let err = AmqpError::StartAborted {
            source: Box::new(AmqpError::DeclareQueueError("orders".to_owned())),
            stop: None,
        };

        assert_eq!(
            err.to_string(),
            "failure to start the bus: failure to declare a queue `orders`"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("ex".to_owned(), "q".to_owned());
        assert_eq!(err.to_string(), "failure to binding exchange `ex` to queue `q`");
    }

    #[test]
    fn only_disconnected_is_disconnected() {
        assert!(AmqpError::Disconnected.is_disconnected());
        assert!(!AmqpError::ConnectionError("refused".to_owned()).is_disconnected());
    }
}
