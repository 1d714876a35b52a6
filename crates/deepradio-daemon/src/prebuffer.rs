//! Speculative preparation of neighbouring stations (Smart mode).
//!
//! The pool maps stream URL to a prepared-but-silent primitive.  Every
//! read-modify-write on it happens under one `tokio::sync::Mutex`; the raw
//! map never leaves this module.  Primitives are always released after the
//! lock is dropped.
use std::collections::HashMap;
use std::sync::Arc;

use deepradio_proto::config::PrebufferConfig;
use deepradio_proto::protocol::Station;
use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::DaemonEvent;
use crate::error::PrimitiveError;
use crate::primitive::{await_ready, BoxedPrimitive, FaultSender, PrimitiveFactory, PrimitiveId};

pub struct PrebufferedEntry {
    pub primitive: BoxedPrimitive,
    pub ready: bool,
    pub station_url: String,
    pub created_at: Instant,
}

impl PrebufferedEntry {
    fn is_expired(&self, ttl: std::time::Duration, now: Instant) -> bool {
        now.duration_since(self.created_at) >= ttl
    }
}

type Pool = Arc<Mutex<HashMap<String, PrebufferedEntry>>>;

pub struct PrebufferManager {
    pool: Pool,
    factory: Arc<dyn PrimitiveFactory>,
    faults: FaultSender,
    config: PrebufferConfig,
    events: mpsc::Sender<DaemonEvent>,
    cycle: Option<CancellationToken>,
    sweeper: Option<CancellationToken>,
}

impl PrebufferManager {
    pub fn new(
        config: PrebufferConfig,
        factory: Arc<dyn PrimitiveFactory>,
        faults: FaultSender,
        events: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            pool: Arc::new(Mutex::new(HashMap::new())),
            factory,
            faults,
            config,
            events,
            cycle: None,
            sweeper: None,
        }
    }

    /// Arm a prebuffer cycle: after the trigger delay, prepare `neighbours`
    /// concurrently and pool the ones that become ready in time.  Replaces
    /// any cycle still in flight.
    pub fn schedule(&mut self, neighbours: Vec<Station>) {
        self.cancel_cycle();
        if neighbours.is_empty() {
            return;
        }

        let token = CancellationToken::new();
        self.cycle = Some(token.clone());

        let cycle = PrebufferCycle {
            pool: Arc::clone(&self.pool),
            factory: Arc::clone(&self.factory),
            faults: self.faults.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            token,
        };
        tokio::spawn(cycle.run(neighbours));
    }

    pub fn cancel_cycle(&mut self) {
        if let Some(token) = self.cycle.take() {
            token.cancel();
        }
    }

    /// Remove and return the ready, unexpired entry for `url`.  An entry is
    /// handed out at most once.
    pub async fn take(&self, url: &str) -> Option<PrebufferedEntry> {
        let mut pool = self.pool.lock().await;
        let entry = pool.remove(url)?;
        drop(pool);

        if entry.ready && !entry.is_expired(self.config.ttl(), Instant::now()) {
            debug!("Prebuffer: handing out {}", url);
            return Some(entry);
        }

        let mut entry = entry;
        entry.primitive.release().await;
        None
    }

    /// Cancel the in-flight cycle and release every pooled primitive.
    pub async fn clear(&mut self) {
        self.cancel_cycle();
        let drained: Vec<PrebufferedEntry> = {
            let mut pool = self.pool.lock().await;
            pool.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            info!("Prebuffer: releasing {} pooled streams", drained.len());
        }
        for mut entry in drained {
            entry.primitive.release().await;
        }
    }

    /// Drop the pooled primitive that reported a fault, if it is ours.
    pub async fn evict(&self, id: PrimitiveId) -> bool {
        let evicted = {
            let mut pool = self.pool.lock().await;
            let key = pool
                .iter()
                .find(|(_, entry)| entry.primitive.id() == id)
                .map(|(url, _)| url.clone());
            key.and_then(|url| pool.remove(&url))
        };
        match evicted {
            Some(mut entry) => {
                warn!("Prebuffer: {} faulted, dropping it", entry.station_url);
                entry.primitive.release().await;
                true
            }
            None => false,
        }
    }

    pub async fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.pool.lock().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start the periodic TTL sweep.  Idempotent.
    pub fn start_sweeper(&mut self) {
        if self.sweeper.is_some() {
            return;
        }
        let token = CancellationToken::new();
        self.sweeper = Some(token.clone());

        let pool = Arc::clone(&self.pool);
        let events = self.events.clone();
        let ttl = self.config.ttl();
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if sweep_pool(&pool, ttl).await > 0 {
                    let _ = events.send(DaemonEvent::PoolChanged).await;
                }
            }
        });
    }

    pub async fn shutdown(&mut self) {
        if let Some(token) = self.sweeper.take() {
            token.cancel();
        }
        self.clear().await;
    }
}

async fn sweep_pool(pool: &Pool, ttl: std::time::Duration) -> usize {
    let now = Instant::now();
    let expired: Vec<PrebufferedEntry> = {
        let mut pool = pool.lock().await;
        let keys: Vec<String> = pool
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl, now))
            .map(|(url, _)| url.clone())
            .collect();
        keys.iter().filter_map(|url| pool.remove(url)).collect()
    };

    let count = expired.len();
    for mut entry in expired {
        debug!("Prebuffer: {} expired", entry.station_url);
        entry.primitive.release().await;
    }
    count
}

/// One armed prebuffer cycle, owned by its task.
struct PrebufferCycle {
    pool: Pool,
    factory: Arc<dyn PrimitiveFactory>,
    faults: FaultSender,
    events: mpsc::Sender<DaemonEvent>,
    config: PrebufferConfig,
    token: CancellationToken,
}

impl PrebufferCycle {
    async fn run(self, neighbours: Vec<Station>) {
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = tokio::time::sleep(self.config.trigger_delay()) => {}
        }

        let candidates: Vec<Station> = {
            let pool = self.pool.lock().await;
            let free = self.config.capacity.saturating_sub(pool.len());
            neighbours
                .into_iter()
                .filter(|s| !pool.contains_key(&s.url))
                .take(free)
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        debug!("Prebuffer: preparing {} neighbours", candidates.len());
        let pooled = join_all(candidates.iter().map(|s| self.prepare_one(s)))
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        debug!("Prebuffer: cycle done, {} pooled", pooled);
    }

    /// Prepare one neighbour.  True if it made it into the pool.
    async fn prepare_one(&self, station: &Station) -> bool {
        if self.token.is_cancelled() {
            return false;
        }

        let mut primitive = match self.factory.create(self.faults.clone()).await {
            Ok(p) => p,
            Err(e) => {
                warn!("Prebuffer: cannot create output for {}: {}", station.name, e);
                return false;
            }
        };

        let timeout = self.config.prepare_timeout();
        let prepared: Result<(), PrimitiveError> = async {
            primitive.set_source(&station.url).await?;
            let readiness = primitive.prepare().await?;
            tokio::select! {
                _ = self.token.cancelled() => Err(PrimitiveError::Abandoned),
                result = await_ready(readiness, Some(timeout)) => result,
            }
        }
        .await;

        if let Err(e) = prepared {
            match e {
                PrimitiveError::Abandoned => debug!("Prebuffer: {} abandoned", station.name),
                e => warn!("Prebuffer: {} failed: {}", station.name, e),
            }
            primitive.release().await;
            return false;
        }

        let rejected = {
            let mut pool = self.pool.lock().await;
            if self.token.is_cancelled()
                || pool.len() >= self.config.capacity
                || pool.contains_key(&station.url)
            {
                Some(primitive)
            } else {
                pool.insert(
                    station.url.clone(),
                    PrebufferedEntry {
                        primitive,
                        ready: true,
                        station_url: station.url.clone(),
                        created_at: Instant::now(),
                    },
                );
                None
            }
        };

        match rejected {
            Some(mut primitive) => {
                debug!("Prebuffer: no slot for {}, releasing", station.name);
                primitive.release().await;
                false
            }
            None => {
                info!("Prebuffer: {} ready", station.name);
                let _ = self.events.send(DaemonEvent::PoolChanged).await;
                true
            }
        }
    }
}
