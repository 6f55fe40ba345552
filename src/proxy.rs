//! The proxy event loop.
//!
//! A single thread owns every combiner mutation coming from the data path:
//! it pulls raw messages off the inbound channel, ingests and admits them,
//! and drains at most one frame per turn. While frames are pending the loop
//! never waits; when the queue is empty it waits up to the idle tick for the
//! next message. Publishing happens after the combiner lock is released, so
//! the HTTP side's `stats` and `reset` never wait on a slow consumer.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::combiner::{publish_frame, Admission, Combiner};
use crate::frame::OrderingKey;
use crate::ingest::InboundMessage;
use crate::publish::FramePublisher;

/// Upper bound on messages ingested per turn, so a busy source cannot starve draining.
pub const MAX_INGEST_BATCH: usize = 64;

/// What one turn of the loop did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TurnReport {
    pub ingested: usize,
    pub rejected: usize,
    pub stale: usize,
    pub evicted: usize,
    pub published: Option<OrderingKey>,
    pub publish_failed: bool,
    /// Every sender has hung up.
    pub disconnected: bool,
}

pub struct ProxyLoop<P> {
    combiner: Arc<Mutex<Combiner<P>>>,
    inbound: Receiver<InboundMessage>,
    idle_tick: Duration,
    health_interval: Option<Duration>,
}

impl<P: FramePublisher + Clone> ProxyLoop<P> {
    pub fn new(
        combiner: Arc<Mutex<Combiner<P>>>,
        inbound: Receiver<InboundMessage>,
        idle_tick: Duration,
    ) -> Self {
        Self {
            combiner,
            inbound,
            idle_tick,
            health_interval: None,
        }
    }

    /// Log per-source counters every `interval` while running.
    pub fn with_health_log(mut self, interval: Duration) -> Self {
        self.health_interval = Some(interval);
        self
    }

    pub fn combiner(&self) -> &Arc<Mutex<Combiner<P>>> {
        &self.combiner
    }

    /// Run one tick: ingest what is waiting, then drain at most one frame.
    pub fn turn(&self) -> TurnReport {
        let mut report = TurnReport::default();
        let wait = if self.lock().queued() > 0 {
            Duration::ZERO
        } else {
            self.idle_tick
        };

        let mut batch = Vec::new();
        match self.inbound.recv_timeout(wait) {
            Ok(message) => batch.push(message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => report.disconnected = true,
        }
        while !report.disconnected && !batch.is_empty() && batch.len() < MAX_INGEST_BATCH {
            match self.inbound.try_recv() {
                Ok(message) => batch.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => report.disconnected = true,
            }
        }

        let next = {
            let mut combiner = self.lock();
            for message in batch {
                match combiner.ingest(message.source, &message.header, message.payload) {
                    Ok(admission) => {
                        report.ingested += 1;
                        match admission {
                            Admission::Queued => {}
                            Admission::Stale => report.stale += 1,
                            Admission::Evicted { .. } => report.evicted += 1,
                        }
                    }
                    Err(err) => {
                        report.rejected += 1;
                        log::warn!("dropping malformed message: {}", err);
                    }
                }
            }
            combiner
                .take_next()
                .map(|frame| (frame, combiner.publisher().clone()))
        };

        // Published with the combiner unlocked; only this thread publishes.
        if let Some((frame, mut publisher)) = next {
            let key = frame.key();
            match publish_frame(&mut publisher, frame) {
                Ok(()) => report.published = Some(key),
                Err(err) => {
                    report.publish_failed = true;
                    log::warn!("publish failed: {:#}", err);
                }
            }
        }
        report
    }

    /// Turn until `shutdown` is set, or until every source has hung up and the
    /// queue is empty. Consumes the loop so the inbound channel closes on return.
    pub fn run(self, shutdown: &AtomicBool) -> Result<()> {
        let mut last_health_log = Instant::now();
        let mut published = 0u64;
        while !shutdown.load(Ordering::SeqCst) {
            let report = self.turn();
            if report.published.is_some() {
                published += 1;
            }
            if report.disconnected && report.published.is_none() && self.lock().queued() == 0 {
                log::info!("all sources closed, event loop exiting");
                break;
            }
            if let Some(interval) = self.health_interval {
                if last_health_log.elapsed() >= interval {
                    self.log_health(published);
                    last_health_log = Instant::now();
                }
            }
        }
        Ok(())
    }

    fn log_health(&self, published: u64) {
        let stats = self.lock().stats();
        log::info!(
            "published={} last_sent={} dropped={} queued={}/{}",
            published,
            stats.last_sent_frame,
            stats.dropped_frames,
            stats.queued_frames,
            stats.queue_length
        );
        for node in &stats.nodes {
            log::info!(
                "source {} received={} dropped={} last_frame={} acquisition={} warned={}",
                node.name,
                node.received_frames,
                node.dropped_frames,
                node.last_frame,
                node.current_acquisition,
                node.has_warned
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, Combiner<P>> {
        self.combiner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
