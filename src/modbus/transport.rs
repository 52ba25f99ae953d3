// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Thread-safe, auto-recovering Modbus RTU transport
//!
//! The RS-485 bus is half-duplex with a single physical medium, so every
//! register operation holds an exclusive lock on the connection for its whole
//! duration. The lock is never held across a backoff or a caller's poll sleep.
//!
//! ## Recovery
//!
//! - Before an operation, a configured connection whose handle reports closed
//!   is reopened once inline.
//! - A communication failure (I/O error, timeout, garbled frame) closes the
//!   handle, waits a short backoff and retries the operation exactly once.
//! - Device exceptions and malformed requests are returned immediately.
//! - A watchdog task wakes up periodically and silently reopens a configured
//!   connection found closed, which catches cable disconnects happening
//!   between two polls of the sequencer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_modbus::ExceptionCode;

use super::drivers::{LinkError, LinkOpener, LinkSettings, ModbusLink};
use crate::config::SerialConfig;

/// Coarse classification of a [`TransportError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No serial port configured or the port could not be (re)opened
    NoConnection,
    /// The line failed twice in a row (timeout, I/O error, garbled frame)
    Communication,
    /// The device answered with a Modbus exception
    DeviceException,
    /// The request was rejected before reaching the wire
    InvalidRequest,
}

/// Failure of a register operation after the transport's own recovery
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial port {} is not connected", .port.as_deref().unwrap_or("<none>"))]
    NotConnected { port: Option<String> },

    #[error("communication with {port} failed after {attempts} attempts: {source}")]
    Communication {
        port: String,
        attempts: u32,
        #[source]
        source: LinkError,
    },

    #[error("device {device_id} rejected register {address}: {code:?}")]
    Exception {
        device_id: u8,
        address: u16,
        code: ExceptionCode,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportError::NotConnected { .. } => TransportErrorKind::NoConnection,
            TransportError::Communication { .. } => TransportErrorKind::Communication,
            TransportError::Exception { .. } => TransportErrorKind::DeviceException,
            TransportError::InvalidRequest(_) => TransportErrorKind::InvalidRequest,
        }
    }
}

/// Register-level access to the bus
///
/// This is the seam between the provisioning sequencer and the transport,
/// which lets the sequencer run against scripted buses in tests.
#[async_trait::async_trait]
pub trait RegisterBus: Send + Sync {
    /// Read `count` holding registers starting at `address` on device `device_id`
    async fn read_holding(
        &self,
        address: u16,
        device_id: u8,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write one holding register on device `device_id`
    async fn write_single(
        &self,
        address: u16,
        value: u16,
        device_id: u8,
    ) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
impl<T: RegisterBus + ?Sized> RegisterBus for Arc<T> {
    async fn read_holding(
        &self,
        address: u16,
        device_id: u8,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        (**self).read_holding(address, device_id, count).await
    }

    async fn write_single(
        &self,
        address: u16,
        value: u16,
        device_id: u8,
    ) -> Result<(), TransportError> {
        (**self).write_single(address, value, device_id).await
    }
}

/// Connection state guarded by the bus lock
#[derive(Default)]
struct Connection {
    /// Settings of the configured port, `None` until a successful connect
    settings: Option<LinkSettings>,
    /// Open handle, `None` while the configured port is closed
    link: Option<Box<dyn ModbusLink>>,
}

impl Connection {
    fn port(&self) -> Option<String> {
        self.settings.as_ref().map(|s| s.port.clone())
    }

    fn is_open(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_open())
    }

    /// A port is configured but its handle is missing or reports closed
    fn needs_reopen(&self) -> bool {
        self.settings.is_some() && !self.is_open()
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    ReadHolding { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
}

impl Operation {
    fn address(&self) -> u16 {
        match self {
            Operation::ReadHolding { address, .. } | Operation::WriteSingle { address, .. } => {
                *address
            }
        }
    }
}

/// Modbus RTU client over a single serial port
///
/// Created with [`ModbusTransport::new`], which also starts the watchdog on
/// the current tokio runtime. The watchdog only holds a weak reference, so
/// dropping the last `Arc` (or calling [`ModbusTransport::close`]) ends it.
pub struct ModbusTransport {
    opener: Box<dyn LinkOpener>,
    config: SerialConfig,
    connection: Mutex<Connection>,
    watchdog_running: Arc<AtomicBool>,
    watchdog: StdMutex<Option<JoinHandle<()>>>,
}

impl ModbusTransport {
    /// Create a transport and start its watchdog
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(opener: impl LinkOpener + 'static, config: SerialConfig) -> Arc<Self> {
        let transport = Arc::new(Self {
            opener: Box::new(opener),
            config,
            connection: Mutex::new(Connection::default()),
            watchdog_running: Arc::new(AtomicBool::new(true)),
            watchdog: StdMutex::new(None),
        });

        let handle = Self::spawn_watchdog(Arc::downgrade(&transport));
        if let Ok(mut slot) = transport.watchdog.lock() {
            *slot = Some(handle);
        }

        transport
    }

    fn spawn_watchdog(weak: Weak<Self>) -> JoinHandle<()> {
        let (running, interval) = match weak.upgrade() {
            Some(transport) => (
                transport.watchdog_running.clone(),
                transport.config.watchdog_interval(),
            ),
            None => (Arc::new(AtomicBool::new(false)), Duration::ZERO),
        };

        tokio::spawn(async move {
            debug!("Serial watchdog started (interval {:?})", interval);
            while running.load(Ordering::SeqCst) {
                time::sleep(interval).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                transport.watchdog_tick().await;
            }
            debug!("Serial watchdog stopped");
        })
    }

    /// One watchdog pass: reopen a configured connection found closed
    async fn watchdog_tick(&self) {
        let mut conn = self.connection.lock().await;
        if !conn.needs_reopen() {
            return;
        }
        let port = conn.port().unwrap_or_default();
        warn!("Watchdog: port {} closed, reconnecting", port);
        let ok = self.reopen(&mut conn).await;
        info!(
            "Watchdog: reconnect to {} {}",
            port,
            if ok { "OK" } else { "FAILED" }
        );
    }

    /// Open `port` with the configured baud rate and timeout
    pub async fn connect(&self, port: &str) -> bool {
        let settings = LinkSettings::new(port, self.config.baud_rate, self.config.timeout());
        self.connect_with(settings).await
    }

    /// Open a port with explicit settings
    ///
    /// Any existing connection is closed first. Returns whether the port could
    /// be opened; a failed open leaves the transport without a configured port.
    pub async fn connect_with(&self, settings: LinkSettings) -> bool {
        let mut conn = self.connection.lock().await;

        if let Some(previous) = conn.port() {
            info!("Closing previous connection ({})", previous);
            conn.close_link().await;
        }

        info!(
            "Opening Modbus RTU client on {} ({} baud, 8N1, timeout {:?})",
            settings.port, settings.baud_rate, settings.timeout
        );
        match self.opener.open(&settings).await {
            Ok(link) => {
                info!("Connection to {}: OK", settings.port);
                conn.link = Some(link);
                conn.settings = Some(settings);
                true
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", settings.port, e);
                conn.link = None;
                conn.settings = None;
                false
            }
        }
    }

    /// Stop the watchdog and release the connection
    ///
    /// Calling it more than once is harmless.
    pub async fn close(&self) {
        self.watchdog_running.store(false, Ordering::SeqCst);
        let handle = self.watchdog.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }

        let mut conn = self.connection.lock().await;
        if let Some(port) = conn.port() {
            conn.close_link().await;
            conn.settings = None;
            info!("Connection to {} closed", port);
        }
    }

    /// Currently configured port
    pub async fn port(&self) -> Option<String> {
        self.connection.lock().await.port()
    }

    /// Whether the configured port is currently open
    pub async fn is_open(&self) -> bool {
        self.connection.lock().await.is_open()
    }

    /// Replace the handle of the configured port with a fresh one
    async fn reopen(&self, conn: &mut Connection) -> bool {
        let Some(settings) = conn.settings.clone() else {
            return false;
        };
        conn.close_link().await;
        match self.opener.open(&settings).await {
            Ok(link) => {
                conn.link = Some(link);
                true
            }
            Err(e) => {
                debug!("Reopening {} failed: {}", settings.port, e);
                false
            }
        }
    }

    async fn execute(&self, device_id: u8, op: Operation) -> Result<Vec<u16>, TransportError> {
        const ATTEMPTS: u32 = 2;
        let mut last_failure = None;

        for attempt in 1..=ATTEMPTS {
            let result = {
                let mut conn = self.connection.lock().await;
                let Some(port) = conn.port() else {
                    return Err(TransportError::NotConnected { port: None });
                };

                if conn.needs_reopen() {
                    info!("Port {} closed, reconnecting", port);
                    let ok = self.reopen(&mut conn).await;
                    info!("Reconnect to {}: {}", port, if ok { "OK" } else { "FAILED" });
                }

                let result = match conn.link.as_mut() {
                    Some(link) if link.is_open() => {
                        match time::timeout(self.config.timeout(), perform(link, device_id, op)).await {
                            Ok(result) => result,
                            Err(_) => Err(LinkError::Timeout(self.config.timeout())),
                        }
                    }
                    _ => Err(LinkError::Closed),
                };

                if matches!(&result, Err(e) if e.is_communication()) {
                    conn.close_link().await;
                }
                result.map_err(|e| (port, e))
            };

            match result {
                Ok(values) => return Ok(values),
                Err((_, LinkError::Exception(code))) => {
                    return Err(TransportError::Exception {
                        device_id,
                        address: op.address(),
                        code,
                    })
                }
                Err((_, LinkError::InvalidRequest(reason))) => {
                    return Err(TransportError::InvalidRequest(reason))
                }
                Err((port, err)) => {
                    warn!(
                        "Serial I/O error on {} (attempt {}): {}",
                        port, attempt, err
                    );
                    last_failure = Some((port, err));
                    if attempt < ATTEMPTS {
                        time::sleep(self.config.retry_backoff()).await;
                    }
                }
            }
        }

        match last_failure {
            Some((port, LinkError::Closed)) => Err(TransportError::NotConnected { port: Some(port) }),
            Some((port, source)) => Err(TransportError::Communication {
                port,
                attempts: ATTEMPTS,
                source,
            }),
            None => Err(TransportError::NotConnected { port: None }),
        }
    }
}

async fn perform(
    link: &mut Box<dyn ModbusLink>,
    device_id: u8,
    op: Operation,
) -> Result<Vec<u16>, LinkError> {
    match op {
        Operation::ReadHolding { address, count } => {
            link.read_holding_registers(device_id, address, count).await
        }
        Operation::WriteSingle { address, value } => link
            .write_single_register(device_id, address, value)
            .await
            .map(|_| Vec::new()),
    }
}

#[async_trait::async_trait]
impl RegisterBus for ModbusTransport {
    async fn read_holding(
        &self,
        address: u16,
        device_id: u8,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.execute(device_id, Operation::ReadHolding { address, count })
            .await
    }

    async fn write_single(
        &self,
        address: u16,
        value: u16,
        device_id: u8,
    ) -> Result<(), TransportError> {
        self.execute(device_id, Operation::WriteSingle { address, value })
            .await
            .map(|_| ())
    }
}

impl Drop for ModbusTransport {
    fn drop(&mut self) {
        self.watchdog_running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.watchdog.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
