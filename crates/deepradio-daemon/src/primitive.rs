//! Seam between the playback engine and whatever actually decodes audio.
//!
//! A primitive is created idle, given a source, prepared (buffering without
//! output) and then started.  Readiness is reported once through the
//! receiver returned by `prepare`; faults after that go out on the shared
//! fault channel tagged with the primitive id.
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::PrimitiveError;

static NEXT_PRIMITIVE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveId(pub u64);

impl PrimitiveId {
    pub fn next() -> Self {
        Self(NEXT_PRIMITIVE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mid-stream failure of a primitive that was already prepared.
#[derive(Debug, Clone)]
pub struct PrimitiveFault {
    pub id: PrimitiveId,
    pub message: String,
}

pub type FaultSender = mpsc::UnboundedSender<PrimitiveFault>;
pub type Readiness = oneshot::Receiver<Result<(), PrimitiveError>>;
pub type BoxedPrimitive = Box<dyn AudioPrimitive>;

#[async_trait]
pub trait AudioPrimitive: Send + Sync {
    fn id(&self) -> PrimitiveId;

    async fn set_source(&mut self, url: &str) -> Result<(), PrimitiveError>;

    /// Begin preparation.  The returned receiver resolves once, with `Ok`
    /// when output can start or the preparation error.
    async fn prepare(&mut self) -> Result<Readiness, PrimitiveError>;

    async fn start(&mut self) -> Result<(), PrimitiveError>;

    async fn pause(&mut self) -> Result<(), PrimitiveError>;

    async fn stop(&mut self) -> Result<(), PrimitiveError>;

    async fn set_volume(&mut self, left: f32, right: f32) -> Result<(), PrimitiveError>;

    /// Free every resource held.  Safe to call more than once.
    async fn release(&mut self);
}

#[async_trait]
pub trait PrimitiveFactory: Send + Sync {
    async fn create(&self, faults: FaultSender) -> Result<BoxedPrimitive, PrimitiveError>;
}

/// Wait for a readiness signal, optionally bounded.
pub async fn await_ready(
    readiness: Readiness,
    timeout: Option<Duration>,
) -> Result<(), PrimitiveError> {
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, readiness)
            .await
            .map_err(|_| PrimitiveError::Timeout(limit))?,
        None => readiness.await,
    };
    outcome.map_err(|_| PrimitiveError::Abandoned)?
}
