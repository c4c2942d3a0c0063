// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{broker::InboundDelivery, message::Headers, serializer::JSON_CONTENT_TYPE};
use chrono::{DateTime, TimeZone, Utc};

/// A deserialized delivery as seen by handlers and pipelines.
#[derive(Debug, Clone)]
pub struct MessageConsumeContext<M> {
    message: M,
    headers: Headers,
    content_type: String,
    message_type: String,
    created_at: DateTime<Utc>,
    delivery_tag: u64,
    message_id: String,
    correlation_id: Option<String>,
    redelivered: bool,
}

impl<M> MessageConsumeContext<M> {
    /// `message_type` is the name the payload was decoded as, which falls back to the
    /// consumer's type when the delivery carries none.
    pub(crate) fn from_delivery(
        message: M,
        message_type: &str,
        delivery: &InboundDelivery,
    ) -> Self {
        let props = &delivery.properties;

        // Deliveries without a broker timestamp are treated as created on arrival.
        let created_at = props
            .timestamp
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        Self {
            message,
            headers: props.headers.clone(),
            content_type: props
                .content_type
                .clone()
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            message_type: message_type.to_owned(),
            created_at,
            delivery_tag: delivery.delivery_tag,
            message_id: props.message_id.clone().unwrap_or_default(),
            correlation_id: props.correlation_id.clone(),
            redelivered: delivery.redelivered,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}
