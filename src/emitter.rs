//! Periodic broadcast of signals through the exported interface.
//!
//! A [`SignalEmitter`] pairs one declared [`SignalEntry`] with a payload
//! callback and a [`SignalSink`]. `start` schedules a task that emits once
//! per period (30 s by default, configurable); `stop` cancels it. Emission is
//! fire-and-forget: no acknowledgment, no delivery guarantee, no subscriber
//! backpressure. Payloads are validated against the declared signature before
//! they leave the process.
//!
//! An emitter without a sink (the service never reached its exported state)
//! logs and skips each emission instead of failing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use zbus::zvariant::OwnedValue;
use zbus::Connection;

use crate::descriptor::SignalEntry;
use crate::dispatch::HandlerError;
use crate::wire;

/// Default emission period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("payload for '{signal}' does not match \"{declared}\": {detail}")]
    PayloadMismatch {
        signal: String,
        declared: String,
        detail: String,
    },

    #[error("payload callback for '{signal}' failed: {detail}")]
    PayloadFailed { signal: String, detail: String },

    #[error("broadcast failed: {0}")]
    Bus(#[from] zbus::Error),
}

/// Produces one signal payload per emission.
pub type PayloadFn = Box<dyn Fn() -> Result<Vec<OwnedValue>, HandlerError> + Send + Sync>;

/// Where broadcasts go. The production sink writes to the bus; tests use a
/// channel sink to observe emission order.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn broadcast(&self, signal: &str, payload: Vec<OwnedValue>) -> Result<(), EmitError>;
}

/// Broadcasts through the exported object on a live connection.
pub struct BusSink {
    connection: Connection,
    object_path: String,
    interface: String,
}

impl BusSink {
    pub fn new(
        connection: Connection,
        object_path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            object_path: object_path.into(),
            interface: interface.into(),
        }
    }
}

#[async_trait]
impl SignalSink for BusSink {
    async fn broadcast(&self, signal: &str, payload: Vec<OwnedValue>) -> Result<(), EmitError> {
        if payload.is_empty() {
            self.connection
                .emit_signal(
                    None::<&str>,
                    self.object_path.as_str(),
                    self.interface.as_str(),
                    signal,
                    &(),
                )
                .await?;
        } else {
            let body = wire::args_structure(payload)?;
            self.connection
                .emit_signal(
                    None::<&str>,
                    self.object_path.as_str(),
                    self.interface.as_str(),
                    signal,
                    &body,
                )
                .await?;
        }
        Ok(())
    }
}

struct EmitterCore {
    entry: SignalEntry,
    sink: Option<Arc<dyn SignalSink>>,
    payload: PayloadFn,
}

impl EmitterCore {
    async fn emit_once(&self) -> Result<(), EmitError> {
        let Some(sink) = &self.sink else {
            debug!(
                "'{}' not exported, skipping emission",
                self.entry.name()
            );
            return Ok(());
        };
        let payload = (self.payload)().map_err(|err| EmitError::PayloadFailed {
            signal: self.entry.name().to_string(),
            detail: err.to_string(),
        })?;
        self.entry
            .payload()
            .check_owned(&payload)
            .map_err(|detail| EmitError::PayloadMismatch {
                signal: self.entry.name().to_string(),
                declared: self.entry.payload().to_string(),
                detail,
            })?;
        trace!("broadcasting '{}'", self.entry.name());
        sink.broadcast(self.entry.name(), payload).await
    }
}

/// Periodic emitter for one declared signal.
pub struct SignalEmitter {
    core: Arc<EmitterCore>,
    task: Option<JoinHandle<()>>,
}

impl SignalEmitter {
    pub fn new(entry: SignalEntry, sink: Option<Arc<dyn SignalSink>>, payload: PayloadFn) -> Self {
        Self {
            core: Arc::new(EmitterCore {
                entry,
                sink,
                payload,
            }),
            task: None,
        }
    }

    /// Whether emissions reach a bus, or are no-ops.
    pub fn is_connected(&self) -> bool {
        self.core.sink.is_some()
    }

    /// Emit one broadcast immediately.
    pub async fn emit_once(&self) -> Result<(), EmitError> {
        self.core.emit_once().await
    }

    /// Schedule periodic emission. The first broadcast happens one full
    /// period after start. Restarting replaces the previous schedule.
    pub fn start(&mut self, period: Duration) {
        self.stop();
        let core = self.core.clone();
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The immediate first tick; emission begins one period in.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = core.emit_once().await {
                    warn!("emission failed: {}", err);
                }
            }
        }));
    }

    /// Cancel the periodic schedule, if any.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SignalEmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SignalEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalEmitter")
            .field("signal", &self.core.entry.name())
            .field("connected", &self.is_connected())
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}
