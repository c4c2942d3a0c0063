// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single physical broker connection shared by every consumer and the
//! producer. Broker-initiated closures are pushed to an error stream; when
//! reconnection is enabled a background recovery loop consumes that stream, redials
//! with exponential backoff and announces every successful redial on the reconnect
//! stream.

use crate::{
    broker::{AmqpChannel, AmqpConnection, Dialer},
    channel::LapinDialer,
    configs::RabbitMQConfigs,
    errors::AmqpError,
};
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 16;

/// How the connection behaves once established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl From<&RabbitMQConfigs> for ConnectionOptions {
    fn from(cfg: &RabbitMQConfigs) -> Self {
        Self {
            reconnect: cfg.reconnect,
            reconnect_delay: cfg.reconnect_delay(),
            max_reconnect_delay: cfg.max_reconnect_delay(),
        }
    }
}

/// The bus-wide broker connection.
pub struct Connection {
    dialer: Arc<dyn Dialer>,
    options: ConnectionOptions,
    current: RwLock<Option<Arc<dyn AmqpConnection>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    dial_lock: tokio::sync::Mutex<()>,
    errors: broadcast::Sender<AmqpError>,
    reconnects: broadcast::Sender<()>,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dials RabbitMQ with the lapin client.
    pub async fn from_configs(cfg: &RabbitMQConfigs) -> Result<Arc<Connection>, AmqpError> {
        Connection::connect(LapinDialer::new(cfg), ConnectionOptions::from(cfg)).await
    }

    /// Dials the broker; a failure is returned to the caller, later drops are not.
    pub async fn connect(
        dialer: Arc<dyn Dialer>,
        options: ConnectionOptions,
    ) -> Result<Arc<Connection>, AmqpError> {
        let (errors, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (reconnects, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let connection = Arc::new(Connection {
            dialer,
            options,
            current: RwLock::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dial_lock: tokio::sync::Mutex::new(()),
            errors,
            reconnects,
            recovery: Mutex::new(None),
        });

        let conn = connection.dialer.dial().await?;
        connection.install(conn);
        info!("amqp connection established");

        if connection.options.reconnect {
            connection.spawn_recovery();
        }

        Ok(connection)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True once [`Connection::close`] was called; a closed connection never redials.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Opens a new channel on the live connection.
    pub async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::Disconnected);
        }

        let conn = self.current.read().clone().ok_or(AmqpError::Disconnected)?;
        conn.create_channel().await
    }

    /// Redials when disconnected; a no-op that emits nothing when already connected.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _guard = self.dial_lock.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }

        if self.is_connected() {
            debug!("already connected, skipping reconnect");
            return Ok(());
        }

        let conn = self.dialer.dial().await?;
        self.install(conn);
        info!("amqp connection re-established");

        let _ = self.reconnects.send(());
        Ok(())
    }

    /// Fires once per broker-initiated closure.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<AmqpError> {
        self.errors.subscribe()
    }

    /// Fires once per successful redial.
    pub fn subscribe_reconnects(&self) -> broadcast::Receiver<()> {
        self.reconnects.subscribe()
    }

    /// Stops the recovery loop and closes the physical connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(recovery) = self.recovery.lock().take() {
            recovery.abort();
        }

        self.connected.store(false, Ordering::SeqCst);
        let conn = self.current.write().take();

        match conn {
            Some(conn) => {
                debug!("closing amqp connection");
                conn.close().await
            }
            None => Ok(()),
        }
    }

    fn install(self: &Arc<Self>, conn: Arc<dyn AmqpConnection>) {
        let closed = conn.on_close();
        *self.current.write() = Some(conn);
        self.connected.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Ok(cause) = closed.await else {
                return;
            };

            let Some(connection) = weak.upgrade() else {
                return;
            };

            if connection.closed.load(Ordering::SeqCst) {
                return;
            }

            warn!(error = cause.to_string(), "amqp connection lost");
            connection.connected.store(false, Ordering::SeqCst);
            let _ = connection.errors.send(cause);
        });
    }

    fn spawn_recovery(self: &Arc<Self>) {
        let errors = self.errors.subscribe();
        let weak = Arc::downgrade(self);
        *self.recovery.lock() = Some(tokio::spawn(recovery_loop(weak, errors)));
    }

    async fn redial(self: &Arc<Self>) {
        let mut delay = self.options.reconnect_delay;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            match self.reconnect().await {
                Ok(()) => return,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        retry_in_ms = delay.as_millis() as u64,
                        "failure to reconnect"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.options.max_reconnect_delay);
                }
            }
        }
    }
}

async fn recovery_loop(connection: Weak<Connection>, mut errors: broadcast::Receiver<AmqpError>) {
    loop {
        match errors.recv().await {
            Ok(cause) => {
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                info!(cause = cause.to_string(), "reconnecting to amqp broker");
                connection.redial().await;
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "connection error notifications lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
