//! irispipe - event-driven camera telemetry pipeline.
//!
//! Three daemons share this crate:
//!
//! 1. `irisd` captures frames on a duty cycle and publishes them to the
//!    raw topic as base64 envelopes.
//! 2. `insightd` subscribes to the raw topic, derives a text insight per
//!    frame through an inference engine, and republishes it.
//! 3. `gatewayd` subscribes to both topics, keeps the most recent value of
//!    each, and serves them over a loopback HTTP reader.
//!
//! # Module Structure
//!
//! - `bus`: MQTT client wrapper with a background delivery thread
//! - `envelope`: application-level payload convention (base64 artifact + type tag)
//! - `capture`: capture device abstraction and frame sources
//! - `producer`: the capture/publish/cooldown duty-cycle state machine
//! - `inference` / `consumer`: per-message inference pipeline
//! - `cache`: concurrently readable latest-value store
//! - `api`: thin HTTP reader over the cache
//!
//! Delivery is best effort. Per-message and per-cycle failures are logged
//! and contained at that granularity; only startup failures terminate a
//! daemon.

pub mod api;
pub mod bus;
pub mod cache;
pub mod capture;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod inference;
pub mod producer;

pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use bus::{BusClient, BusConfig, BusPublisher, BusSender, Message};
pub use cache::{CacheEntry, CachedValue, LatestStateCache, TopicSchema};
pub use capture::{open_capture_device, CaptureDevice, CaptureHandle, Frame, FrameProcessor};
pub use config::PipelineConfig;
pub use consumer::{InsightConsumer, InsightConsumerConfig};
pub use envelope::Envelope;
pub use inference::{InferenceEngine, InferenceOptions, StubEngine};
pub use producer::{CycleState, DutyCycle, DutyCycleConfig};
