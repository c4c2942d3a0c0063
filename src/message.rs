// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages, Headers and Notifications
//!
//! Every payload carried by the bus implements [`Message`]. Its type name is the key
//! used by the serializer registry and the source of the default topology names.

use serde::{de::DeserializeOwned, Serialize};
use std::{any::Any, collections::BTreeMap, sync::Arc};

/// A payload that can travel through the bus.
///
/// The default `message_type` is the snake-cased short name of the Rust type,
/// so `OrderCreated` becomes `order_created`.
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn message_type() -> String {
        short_type_name::<Self>()
    }
}

/// Snake-cased short name of `T`, without module path or generic arguments.
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    let short = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);

    to_snake_case(short)
}

pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).and_then(|p| chars.get(p));
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if *c == '-' || *c == ' ' {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(*c);
        }
    }

    out
}

/// A single header or argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    ShortInt(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUInt(u32),
    ShortString(String),
    LongString(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::ShortString(v) | HeaderValue::LongString(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::LongInt(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

/// Message headers (metadata) keyed by header name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Declaration arguments for exchanges, queues and bindings.
pub type Arguments = BTreeMap<String, HeaderValue>;

/// What observers see when a message was produced or consumed.
#[derive(Clone)]
pub struct MessageNotification {
    pub message_type: String,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub headers: Headers,
    pub(crate) message: Arc<dyn Any + Send + Sync>,
}

impl MessageNotification {
    pub(crate) fn new<M: Message>(
        message: M,
        message_id: &str,
        correlation_id: Option<String>,
        headers: Headers,
    ) -> Self {
        Self {
            message_type: M::message_type(),
            message_id: message_id.to_owned(),
            correlation_id,
            headers,
            message: Arc::new(message),
        }
    }

    /// The message itself, when it is of type `M`.
    pub fn message<M: Message>(&self) -> Option<&M> {
        self.message.downcast_ref::<M>()
    }
}

impl std::fmt::Debug for MessageNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageNotification")
            .field("message_type", &self.message_type)
            .field("message_id", &self.message_id)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// Callback registered through `is_consumed` / `is_produced`.
pub type MessageObserver = Arc<dyn Fn(&MessageNotification) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        id: u32,
    }
    impl Message for OrderCreated {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Renamed;
    impl Message for Renamed {
        fn message_type() -> String {
            "custom".to_owned()
        }
    }

    #[test]
    fn message_type_defaults_to_snake_cased_short_name() {
        assert_eq!(OrderCreated::message_type(), "order_created");
        assert_eq!(Renamed::message_type(), "custom");
    }

    #[test]
    fn snake_case_handles_acronyms_and_digits() {
        assert_eq!(to_snake_case("HTTPRequestSent"), "http_request_sent");
        assert_eq!(to_snake_case("Order2Shipped"), "order2_shipped");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
        assert_eq!(to_snake_case("kebab-Name"), "kebab_name");
    }

    #[test]
    fn short_type_name_drops_generics() {
        assert_eq!(short_type_name::<Vec<OrderCreated>>(), "vec");
    }

    #[test]
    fn notification_downcasts_to_original_message() {
        let notification =
            MessageNotification::new(OrderCreated { id: 7 }, "id-1", None, Headers::new());

        assert_eq!(notification.message_type, "order_created");
        assert_eq!(notification.message::<OrderCreated>(), Some(&OrderCreated { id: 7 }));
        assert!(notification.message::<Renamed>().is_none());
    }
}
