//! Frame ingestion.
//!
//! One `SourceSubscriber` per configured producer. Subscribers only split the
//! byte stream into `(header, payload)` messages and hand them to the event
//! loop over a bounded channel; decoding, wrap detection and admission happen
//! on the loop thread.
//!
//! Delivery is at-most-once: messages in flight when a connection drops are lost.

pub mod subscriber;

pub use subscriber::{InboundMessage, SourceSubscriber, SubscriberConfig, SubscriberStats};
