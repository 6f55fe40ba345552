//! Live View Proxy
//!
//! Combines frame streams from several upstream producers into one ordered
//! stream for a live-view consumer.
//!
//! # Architecture
//!
//! Each producer publishes two-part messages (JSON header carrying
//! `frame_num`, then an opaque payload). The proxy:
//!
//! 1. Subscribes to every producer on its own thread (`ingest`).
//! 2. Detects acquisition restarts per source when `frame_num` goes backwards,
//!    assigning each frame an `OrderingKey` of (acquisition, frame) (`source`).
//! 3. Buffers frames in a bounded min-ordered queue that evicts the oldest
//!    frame when full (`queue`).
//! 4. Publishes the oldest queued frame, never going backwards past the
//!    last published key (`combiner`).
//! 5. Exposes stats and a reset over a small HTTP API (`api`).
//!
//! Delivery is best-effort: frames that arrive late or overflow the queue are
//! dropped and counted, never retried.
//!
//! # Module Structure
//!
//! - `frame`: OrderingKey, FrameHeader, Frame
//! - `source`: per-source wrap detection and drop-rate monitoring
//! - `queue`: the bounded reordering queue
//! - `combiner`: admission, draining, reset, stats
//! - `proxy`: the single-threaded event loop
//! - `ingest`, `publish`, `transport`: the TCP edges and the wire format
//! - `config`, `api`: runtime configuration and the control surface

pub mod api;
pub mod combiner;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod proxy;
pub mod publish;
pub mod queue;
pub mod source;
pub mod transport;

pub use combiner::{
    Admission, Combiner, CombinerSettings, CombinerStats, ControlSurface, SourceId,
};
pub use config::{ProxyConfig, SourceSpec};
pub use frame::{Frame, FrameHeader, OrderingKey, FRAME_NUM_FIELD};
pub use ingest::{InboundMessage, SourceSubscriber, SubscriberConfig};
pub use proxy::{ProxyLoop, TurnReport};
pub use publish::{
    FramePublisher, InMemoryFramePublisher, PublishedFrame, SharedPublisher, TcpFramePublisher,
};
pub use queue::{PushOutcome, ReorderingQueue};
pub use source::{DropMonitor, SourceStats, SourceTracker};
pub use transport::{parse_endpoint, Endpoint};
