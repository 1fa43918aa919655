//! Insight consumer: the per-message inference pipeline.
//!
//! For each message on the raw-artifact topic: decode the envelope, build
//! the prompt, run inference, publish the resulting text to the insight
//! topic. Every failure (malformed envelope, missing artifact, bad base64,
//! engine error, local publish error) drops that one message with a logged
//! reason and leaves the consumer listening. There is no per-message
//! retry; the next cycle's frame is independent.
//!
//! The prompt is a static template conditioned only on the artifact's
//! presence; the artifact content itself is not fed to the engine.

use anyhow::{anyhow, Context, Result};

use crate::bus::{BusPublisher, Message};
use crate::envelope::Envelope;
use crate::inference::{InferenceEngine, InferenceOptions};

const DEFAULT_PROMPT: &str = "A face was detected in a camera frame. \
What general observations or insights can you provide about a face in the image?";

#[derive(Clone, Debug)]
pub struct InsightConsumerConfig {
    pub raw_topic: String,
    pub insight_topic: String,
    pub prompt: String,
    pub options: InferenceOptions,
}

impl Default for InsightConsumerConfig {
    fn default() -> Self {
        Self {
            raw_topic: "camera/feed".to_string(),
            insight_topic: "llm/insight".to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            options: InferenceOptions::default(),
        }
    }
}

pub struct InsightConsumer {
    cfg: InsightConsumerConfig,
    engine: Box<dyn InferenceEngine>,
    processed: u64,
    dropped: u64,
}

impl InsightConsumer {
    pub fn new(cfg: InsightConsumerConfig, engine: Box<dyn InferenceEngine>) -> Self {
        log::info!(
            "insight consumer: engine={} {} -> {}",
            engine.name(),
            cfg.raw_topic,
            cfg.insight_topic
        );
        Self {
            cfg,
            engine,
            processed: 0,
            dropped: 0,
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Process one raw-artifact message. An error means the message was
    /// dropped; the caller logs it and keeps listening.
    pub fn handle_message(&mut self, msg: &Message, bus: &impl BusPublisher) -> Result<()> {
        if msg.topic != self.cfg.raw_topic {
            log::debug!("ignoring message on unexpected topic {}", msg.topic);
            return Ok(());
        }
        match self.process(msg, bus) {
            Ok(()) => {
                self.processed += 1;
                Ok(())
            }
            Err(e) => {
                self.dropped += 1;
                Err(e)
            }
        }
    }

    fn process(&mut self, msg: &Message, bus: &impl BusPublisher) -> Result<()> {
        let envelope = Envelope::from_payload(&msg.payload)?;
        let artifact = envelope
            .artifact_bytes()?
            .ok_or_else(|| anyhow!("envelope carries no artifact"))?;
        log::debug!(
            "frame received: {} bytes, {}",
            artifact.len(),
            envelope.media_type_or_default()
        );

        let insight = self
            .engine
            .infer(&self.cfg.prompt, &self.cfg.options)
            .context("inference failed")?;
        let insight = insight.trim();
        if insight.is_empty() {
            return Err(anyhow!("inference produced empty output"));
        }

        bus.publish(&self.cfg.insight_topic, insight.as_bytes())?;
        log::info!("published insight to {}: '{}'", self.cfg.insight_topic, insight);
        Ok(())
    }
}
