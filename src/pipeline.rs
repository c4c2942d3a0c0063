// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers and Pipelines
//!
//! A handler is the terminal step that processes a message. Pipelines wrap it like
//! middleware: the first registered pipeline is the outermost one, sees the delivery
//! first and the result last. A pipeline that returns without running `next`
//! short-circuits every inner pipeline and the handler.

use crate::{context::MessageConsumeContext, errors::AmqpError, message::Message};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use std::sync::Arc;

/// Terminal step processing a message of type `M`.
#[async_trait]
pub trait ConsumerHandler<M: Message>: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        message: &MessageConsumeContext<M>,
    ) -> Result<(), AmqpError>;
}

/// Middleware wrapped around a handler.
#[async_trait]
pub trait ConsumerPipeline<M: Message>: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        message: &MessageConsumeContext<M>,
        next: Next<'_>,
    ) -> Result<(), AmqpError>;
}

type Continuation<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), AmqpError>> + Send + 'a>;

/// The rest of the chain: inner pipelines followed by the handler.
pub struct Next<'a> {
    continuation: Continuation<'a>,
}

impl<'a> Next<'a> {
    fn new(continuation: Continuation<'a>) -> Self {
        Self { continuation }
    }

    /// Runs the remainder of the chain.
    pub async fn run(self) -> Result<(), AmqpError> {
        (self.continuation)().await
    }
}

/// Composes `pipelines` around `handler` and runs the chain once.
pub(crate) async fn execute<M: Message>(
    ctx: &Context,
    handler: &dyn ConsumerHandler<M>,
    pipelines: &[Arc<dyn ConsumerPipeline<M>>],
    message: &MessageConsumeContext<M>,
) -> Result<(), AmqpError> {
    compose(ctx, handler, pipelines, message).run().await
}

fn compose<'a, M: Message>(
    ctx: &'a Context,
    handler: &'a dyn ConsumerHandler<M>,
    pipelines: &'a [Arc<dyn ConsumerPipeline<M>>],
    message: &'a MessageConsumeContext<M>,
) -> Next<'a> {
    let terminal = Next::new(Box::new(move || handler.handle(ctx, message)));

    pipelines.iter().rev().fold(terminal, |next, pipeline| {
        Next::new(Box::new(move || pipeline.handle(ctx, message, next)))
    })
}
