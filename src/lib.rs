// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod bus;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod consumer_configuration;
pub mod context;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod pipeline;
pub mod producer;
pub mod producer_configuration;
pub mod queue;
pub mod serializer;
pub mod topology;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
