//! Frame combiner.
//!
//! Owns every `SourceTracker`, the `ReorderingQueue` and the publisher. All
//! mutation goes through four operations:
//!
//! - `admit`: stale frames (key at or below the last published key) are
//!   dropped and charged to their source; everything else is queued, evicting
//!   the oldest pending frame if the queue is full.
//! - `drain`: pop the smallest key, advance the low-water mark, publish.
//! - `reset`: forget the low-water mark and every counter.
//! - `stats`: read-only snapshot.
//!
//! Published keys never decrease between resets. Reset does not purge frames
//! already buffered; they are still published on later drains.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};

use crate::config::SourceSpec;
use crate::frame::{Frame, OrderingKey};
use crate::publish::FramePublisher;
use crate::queue::{PushOutcome, ReorderingQueue};
use crate::source::{validate_cutoff, SourceStats, SourceTracker};

/// Index of a source inside its combiner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub usize);

/// What happened to an admitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Queued, but the queue was full and `evicted` was discarded to make room.
    Evicted { evicted: OrderingKey },
    /// At or below the last published key; discarded.
    Stale,
}

#[derive(Clone, Debug)]
pub struct CombinerSettings {
    pub destination: String,
    pub queue_length: usize,
    pub drop_warn_cutoff: f64,
}

/// Read-only snapshot of the combiner.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CombinerStats {
    pub destination: String,
    pub last_sent_frame: OrderingKey,
    pub dropped_frames: u64,
    pub queued_frames: usize,
    pub queue_length: usize,
    pub drop_warn_cutoff: f64,
    pub nodes: Vec<SourceStats>,
}

impl CombinerStats {
    pub fn node(&self, name: &str) -> Option<&SourceStats> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

pub struct Combiner<P> {
    sources: Vec<SourceTracker>,
    queue: ReorderingQueue,
    // None until the first publish (and again after reset).
    last_published: Option<OrderingKey>,
    dropped_frames: u64,
    destination: String,
    drop_warn_cutoff: f64,
    publisher: P,
}

impl<P: FramePublisher> Combiner<P> {
    pub fn new(settings: CombinerSettings, sources: &[SourceSpec], publisher: P) -> Result<Self> {
        validate_cutoff(settings.drop_warn_cutoff)?;
        let queue = ReorderingQueue::new(settings.queue_length)?;
        let sources = sources
            .iter()
            .map(|spec| {
                SourceTracker::new(
                    spec.name.clone(),
                    spec.endpoint.to_string(),
                    settings.drop_warn_cutoff,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            sources,
            queue,
            last_published: None,
            dropped_frames: 0,
            destination: settings.destination,
            drop_warn_cutoff: settings.drop_warn_cutoff,
            publisher,
        })
    }

    /// Decode a raw message from `source` and admit the resulting frame.
    ///
    /// A malformed header is returned as an error and changes no counters.
    pub fn ingest(&mut self, source: SourceId, raw_header: &[u8], payload: Vec<u8>) -> Result<Admission> {
        let tracker = self.tracker_mut(source)?;
        let frame = tracker.ingest(raw_header, payload)?;
        self.admit(frame, source)
    }

    /// Admit a frame produced by `source`.
    pub fn admit(&mut self, frame: Frame, source: SourceId) -> Result<Admission> {
        let key = frame.key();
        if self.is_stale(key) {
            let tracker = self.tracker_mut(source)?;
            tracker.record_drop();
            log::trace!("source {}: dropped stale frame {}", tracker.name(), key);
            return Ok(Admission::Stale);
        }
        // Validate the id before touching the queue.
        self.tracker_mut(source)?;

        match self.queue.try_push(frame) {
            PushOutcome::Queued => Ok(Admission::Queued),
            PushOutcome::Evicted(old) => {
                self.dropped_frames += 1;
                log::debug!("queue full, discarded frame {} to admit {}", old.key(), key);
                Ok(Admission::Evicted { evicted: old.key() })
            }
        }
    }

    /// Publish the smallest pending frame, if any.
    ///
    /// The low-water mark advances before publishing; a failed publish loses
    /// the frame and is returned to the caller.
    pub fn drain(&mut self) -> Result<Option<OrderingKey>> {
        let Some(frame) = self.take_next() else {
            return Ok(None);
        };
        let key = frame.key();
        publish_frame(&mut self.publisher, frame)?;
        Ok(Some(key))
    }

    /// Pop the smallest pending frame and advance the low-water mark to it,
    /// leaving publishing to the caller. The frame counts as sent either way.
    pub fn take_next(&mut self) -> Option<Frame> {
        let frame = self.queue.pop_min()?;
        self.last_published = Some(frame.key());
        Some(frame)
    }

    /// Start over for a new acquisition. Buffered frames are kept.
    pub fn reset(&mut self) {
        self.last_published = None;
        self.dropped_frames = 0;
        for source in &mut self.sources {
            source.reset();
        }
        log::info!("combiner reset ({} frame(s) still buffered)", self.queue.len());
    }

    /// Change the drop warning cutoff for every source.
    pub fn set_drop_warn_cutoff(&mut self, cutoff: f64) -> Result<()> {
        validate_cutoff(cutoff)?;
        for source in &mut self.sources {
            source.set_drop_warn_cutoff(cutoff)?;
        }
        self.drop_warn_cutoff = cutoff;
        Ok(())
    }

    pub fn stats(&self) -> CombinerStats {
        CombinerStats {
            destination: self.destination.clone(),
            last_sent_frame: self.last_published_key(),
            dropped_frames: self.dropped_frames,
            queued_frames: self.queue.len(),
            queue_length: self.queue.capacity(),
            drop_warn_cutoff: self.drop_warn_cutoff,
            nodes: self.sources.iter().map(SourceTracker::stats).collect(),
        }
    }

    /// Low-water mark as reported: `(0, 0)` before anything was published.
    pub fn last_published_key(&self) -> OrderingKey {
        self.last_published.unwrap_or_default()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn source_id(&self, name: &str) -> Option<SourceId> {
        self.sources
            .iter()
            .position(|source| source.name() == name)
            .map(SourceId)
    }

    pub fn source(&self, id: SourceId) -> Option<&SourceTracker> {
        self.sources.get(id.0)
    }

    pub fn sources(&self) -> impl Iterator<Item = (SourceId, &SourceTracker)> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, source)| (SourceId(i), source))
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    fn is_stale(&self, key: OrderingKey) -> bool {
        matches!(self.last_published, Some(last) if key <= last)
    }

    fn tracker_mut(&mut self, id: SourceId) -> Result<&mut SourceTracker> {
        self.sources
            .get_mut(id.0)
            .ok_or_else(|| anyhow!("unknown source id {}", id.0))
    }
}

/// Publish a frame taken with `Combiner::take_next`.
pub fn publish_frame<P: FramePublisher + ?Sized>(publisher: &mut P, frame: Frame) -> Result<()> {
    let key = frame.key();
    let (header, payload) = frame.into_parts();
    publisher
        .publish(&header, &payload)
        .with_context(|| format!("frame {} lost", key))
}

// ----------------------------------------------------------------------------
// ControlSurface: what the HTTP side may do
// ----------------------------------------------------------------------------

/// Operator-facing view of a running combiner.
///
/// Calls take the combiner lock. `ProxyLoop` never publishes while holding
/// it, so a slow consumer does not stall these calls.
pub trait ControlSurface: Send + Sync {
    fn stats(&self) -> CombinerStats;
    fn reset(&self);
}

impl<P: FramePublisher + Send> ControlSurface for Mutex<Combiner<P>> {
    fn stats(&self) -> CombinerStats {
        self.lock().unwrap_or_else(PoisonError::into_inner).stats()
    }

    fn reset(&self) {
        self.lock().unwrap_or_else(PoisonError::into_inner).reset()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeader;
    use crate::publish::InMemoryFramePublisher;
    use crate::transport::parse_endpoint;
    use serde_json::json;

    fn specs(names: &[&str]) -> Vec<SourceSpec> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| SourceSpec {
                name: name.to_string(),
                endpoint: parse_endpoint(&format!("tcp://127.0.0.1:{}", 5010 + i)).unwrap(),
            })
            .collect()
    }

    fn combiner(queue_length: usize) -> (Combiner<InMemoryFramePublisher>, InMemoryFramePublisher) {
        let publisher = InMemoryFramePublisher::new();
        let settings = CombinerSettings {
            destination: "tcp://127.0.0.1:5020".to_string(),
            queue_length,
            drop_warn_cutoff: 0.5,
        };
        let combiner =
            Combiner::new(settings, &specs(&["node_1", "node_2"]), publisher.clone()).unwrap();
        (combiner, publisher)
    }

    fn frame(acquisition: u64, frame_num: u64) -> Frame {
        let header = FrameHeader::from_value(json!({ "frame_num": frame_num })).unwrap();
        Frame::new(OrderingKey::new(acquisition, frame_num), header, vec![1, 2, 3])
    }

    fn raw(frame_num: u64) -> Vec<u8> {
        format!(r#"{{"frame_num": {}}}"#, frame_num).into_bytes()
    }

    #[test]
    fn first_frame_zero_is_not_stale() {
        let (mut c, publisher) = combiner(4);
        assert_eq!(c.admit(frame(0, 0), SourceId(0)).unwrap(), Admission::Queued);
        assert_eq!(c.drain().unwrap(), Some(OrderingKey::new(0, 0)));
        assert_eq!(publisher.frame_nums(), vec![0]);
    }

    #[test]
    fn equal_to_last_published_is_stale() {
        let (mut c, _) = combiner(4);
        c.admit(frame(0, 3), SourceId(0)).unwrap();
        c.drain().unwrap();
        assert_eq!(c.admit(frame(0, 3), SourceId(1)).unwrap(), Admission::Stale);
        assert_eq!(c.source(SourceId(1)).unwrap().dropped_frames(), 1);
        assert_eq!(c.queued(), 0);
    }

    #[test]
    fn below_last_published_is_stale() {
        let (mut c, _) = combiner(4);
        c.admit(frame(0, 5), SourceId(0)).unwrap();
        c.drain().unwrap();
        assert_eq!(c.admit(frame(0, 1), SourceId(1)).unwrap(), Admission::Stale);
        assert_eq!(c.admit(frame(0, 6), SourceId(1)).unwrap(), Admission::Queued);
        assert_eq!(c.source(SourceId(1)).unwrap().dropped_frames(), 1);
        assert_eq!(c.source(SourceId(0)).unwrap().dropped_frames(), 0);
    }

    #[test]
    fn eviction_counts_globally_not_per_source() {
        let (mut c, _) = combiner(2);
        c.admit(frame(0, 1), SourceId(0)).unwrap();
        c.admit(frame(0, 2), SourceId(0)).unwrap();
        let admission = c.admit(frame(0, 3), SourceId(1)).unwrap();
        assert_eq!(
            admission,
            Admission::Evicted {
                evicted: OrderingKey::new(0, 1)
            }
        );
        assert_eq!(c.dropped_frames(), 1);
        assert_eq!(c.source(SourceId(0)).unwrap().dropped_frames(), 0);
        assert_eq!(c.source(SourceId(1)).unwrap().dropped_frames(), 0);
    }

    #[test]
    fn drain_on_empty_queue_changes_nothing() {
        let (mut c, publisher) = combiner(4);
        let before = c.stats();
        assert_eq!(c.drain().unwrap(), None);
        assert_eq!(c.stats(), before);
        assert!(publisher.published().is_empty());
    }

    #[test]
    fn failed_publish_loses_frame_and_advances_mark() {
        let (mut c, publisher) = combiner(4);
        c.admit(frame(0, 4), SourceId(0)).unwrap();
        c.admit(frame(0, 5), SourceId(0)).unwrap();
        publisher.fail_next(1);

        assert!(c.drain().is_err());
        assert_eq!(c.last_published_key(), OrderingKey::new(0, 4));
        assert_eq!(c.drain().unwrap(), Some(OrderingKey::new(0, 5)));
        assert_eq!(publisher.frame_nums(), vec![5]);
    }

    #[test]
    fn ingest_routes_through_tracker() {
        let (mut c, _) = combiner(4);
        let id = c.source_id("node_2").unwrap();
        assert_eq!(c.ingest(id, &raw(7), Vec::new()).unwrap(), Admission::Queued);
        assert!(c.ingest(id, b"garbage", Vec::new()).is_err());
        assert!(c.ingest(SourceId(9), &raw(1), Vec::new()).is_err());

        let stats = c.stats();
        let node = stats.node("node_2").unwrap();
        assert_eq!(node.received_frames, 1);
        assert_eq!(node.last_frame, 7);
        assert_eq!(stats.queued_frames, 1);
    }

    #[test]
    fn unknown_source_never_reaches_queue() {
        let (mut c, _) = combiner(4);
        assert!(c.admit(frame(0, 1), SourceId(5)).is_err());
        assert_eq!(c.queued(), 0);
    }

    #[test]
    fn acquisition_wrap_orders_after_previous_run() {
        let (mut c, publisher) = combiner(8);
        let id = SourceId(0);
        for n in [5, 6, 7] {
            c.ingest(id, &raw(n), Vec::new()).unwrap();
        }
        c.drain().unwrap();
        // producer restarted: 0 is a new acquisition, not stale
        assert_eq!(c.ingest(id, &raw(0), Vec::new()).unwrap(), Admission::Queued);
        while c.drain().unwrap().is_some() {}
        assert_eq!(publisher.frame_nums(), vec![5, 6, 7, 0]);
        assert_eq!(c.last_published_key(), OrderingKey::new(1, 0));
    }

    #[test]
    fn set_cutoff_applies_to_every_source() {
        let (mut c, _) = combiner(4);
        c.set_drop_warn_cutoff(0.2).unwrap();
        assert!(c.set_drop_warn_cutoff(1.2).is_err());
        assert!(c
            .sources()
            .all(|(_, s)| (s.monitor().warn_cutoff() - 0.2).abs() < 1e-12));
        assert!((c.stats().drop_warn_cutoff - 0.2).abs() < 1e-12);
    }

    #[test]
    fn control_surface_shares_state() {
        let (c, _) = combiner(4);
        let shared = Mutex::new(c);
        {
            let mut guard = shared.lock().unwrap();
            guard.admit(frame(0, 2), SourceId(0)).unwrap();
            guard.drain().unwrap();
        }
        let surface: &dyn ControlSurface = &shared;
        assert_eq!(surface.stats().last_sent_frame, OrderingKey::new(0, 2));
        surface.reset();
        assert_eq!(surface.stats().last_sent_frame, OrderingKey::new(0, 0));
    }
}
