//! Per-source frame tracking.
//!
//! One `SourceTracker` exists per configured producer. It turns raw messages
//! into `Frame`s, notices when the producer restarts an acquisition (frame
//! numbers go backwards), and keeps the counters reported by the control
//! surface. The drop-rate health signal lives in `DropMonitor`.

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::frame::{Frame, FrameHeader, OrderingKey};

/// Fixed ratio between the warn and unwarn thresholds.
pub const UNWARN_RATIO: f64 = 0.75;

// ----------------------------------------------------------------------------
// DropMonitor: hysteresis on the drop ratio
// ----------------------------------------------------------------------------

/// Hysteresis warning state for a source's drop ratio.
///
/// Warns once when the ratio rises above `warn_cutoff`, and re-arms only after
/// it falls below `warn_cutoff * 0.75`.
#[derive(Clone, Debug)]
pub struct DropMonitor {
    warn_cutoff: f64,
    unwarn_cutoff: f64,
    has_warned: bool,
}

impl DropMonitor {
    pub fn new(warn_cutoff: f64) -> Result<Self> {
        validate_cutoff(warn_cutoff)?;
        Ok(Self {
            warn_cutoff,
            unwarn_cutoff: warn_cutoff * UNWARN_RATIO,
            has_warned: false,
        })
    }

    /// Feed the current counters. Returns true when a warning should be emitted.
    pub fn observe(&mut self, dropped: u64, received: u64) -> bool {
        let ratio = drop_ratio(dropped, received);
        if ratio > self.warn_cutoff && !self.has_warned {
            self.has_warned = true;
            return true;
        }
        if ratio < self.unwarn_cutoff {
            self.has_warned = false;
        }
        false
    }

    pub fn rearm(&mut self) {
        self.has_warned = false;
    }

    pub fn has_warned(&self) -> bool {
        self.has_warned
    }

    pub fn warn_cutoff(&self) -> f64 {
        self.warn_cutoff
    }

    pub fn unwarn_cutoff(&self) -> f64 {
        self.unwarn_cutoff
    }
}

pub fn drop_ratio(dropped: u64, received: u64) -> f64 {
    if received == 0 {
        return 0.0;
    }
    dropped as f64 / received as f64
}

pub(crate) fn validate_cutoff(cutoff: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&cutoff) {
        return Err(anyhow!(
            "dropped frame warning cutoff must be within 0..=1 (got {})",
            cutoff
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// SourceTracker
// ----------------------------------------------------------------------------

/// Read-only snapshot of one source.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceStats {
    pub name: String,
    pub endpoint: String,
    pub received_frames: u64,
    pub dropped_frames: u64,
    pub last_frame: u64,
    pub current_acquisition: u64,
    pub has_warned: bool,
}

#[derive(Clone, Debug)]
pub struct SourceTracker {
    name: String,
    endpoint: String,
    received_frames: u64,
    dropped_frames: u64,
    // Starts at 0; frame numbers are unsigned, so the first frame never wraps.
    last_frame: u64,
    current_acquisition: u64,
    monitor: DropMonitor,
}

impl SourceTracker {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, warn_cutoff: f64) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            received_frames: 0,
            dropped_frames: 0,
            last_frame: 0,
            current_acquisition: 0,
            monitor: DropMonitor::new(warn_cutoff)?,
        })
    }

    /// Decode a raw message into a `Frame`, tracking acquisition wraps.
    ///
    /// A header that fails to decode leaves every counter untouched.
    pub fn ingest(&mut self, raw_header: &[u8], payload: Vec<u8>) -> Result<Frame> {
        let header = FrameHeader::decode(raw_header)
            .map_err(|e| anyhow!("source {}: {}", self.name, e))?;
        Ok(self.ingest_header(header, payload))
    }

    /// Same as `ingest` for an already decoded header.
    pub fn ingest_header(&mut self, header: FrameHeader, payload: Vec<u8>) -> Frame {
        let frame_num = header.frame_num();
        if frame_num < self.last_frame {
            self.current_acquisition += 1;
            self.monitor.rearm();
            log::debug!(
                "source {}: frame number reset ({} -> {}), acquisition {} started",
                self.name,
                self.last_frame,
                frame_num,
                self.current_acquisition
            );
        }
        self.last_frame = frame_num;
        self.received_frames += 1;
        Frame::new(
            OrderingKey::new(self.current_acquisition, frame_num),
            header,
            payload,
        )
    }

    /// Count a frame dropped for being stale. Returns true if this drop raised the warning.
    pub fn record_drop(&mut self) -> bool {
        self.dropped_frames += 1;
        let warned = self
            .monitor
            .observe(self.dropped_frames, self.received_frames);
        if warned {
            log::warn!(
                "source {} has dropped {:.0}% of frames",
                self.name,
                self.drop_ratio() * 100.0
            );
        }
        warned
    }

    pub fn reset(&mut self) {
        self.received_frames = 0;
        self.dropped_frames = 0;
        self.last_frame = 0;
        self.current_acquisition = 0;
        self.monitor.rearm();
    }

    /// Replace the hysteresis band. The warned state is kept.
    pub fn set_drop_warn_cutoff(&mut self, cutoff: f64) -> Result<()> {
        let has_warned = self.monitor.has_warned();
        self.monitor = DropMonitor::new(cutoff)?;
        self.monitor.has_warned = has_warned;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn received_frames(&self) -> u64 {
        self.received_frames
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn last_frame(&self) -> u64 {
        self.last_frame
    }

    pub fn current_acquisition(&self) -> u64 {
        self.current_acquisition
    }

    pub fn has_warned(&self) -> bool {
        self.monitor.has_warned()
    }

    pub fn drop_ratio(&self) -> f64 {
        drop_ratio(self.dropped_frames, self.received_frames)
    }

    pub fn monitor(&self) -> &DropMonitor {
        &self.monitor
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            received_frames: self.received_frames,
            dropped_frames: self.dropped_frames,
            last_frame: self.last_frame,
            current_acquisition: self.current_acquisition,
            has_warned: self.monitor.has_warned(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
