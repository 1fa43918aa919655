//! Shared pipeline configuration.
//!
//! Settings come from three layers, later layers winning: built-in
//! defaults, an optional JSON config file named by `IRIS_CONFIG`, and
//! `IRIS_*` environment variables. Each daemon loads the same file and
//! reads the sections it cares about.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
pub const DEFAULT_RAW_TOPIC: &str = "camera/feed";
pub const DEFAULT_INSIGHT_TOPIC: &str = "llm/insight";
pub const DEFAULT_GATEWAY_ADDR: &str = "127.0.0.1:8780";
pub const DEFAULT_CAPTURE_SOURCE: &str = "stub://camera0";
pub const DEFAULT_ENGINE: &str = "stub://";
const DEFAULT_CAPTURE_WINDOW_SECS: u64 = 5;
const DEFAULT_COOLDOWN_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    broker_addr: Option<String>,
    raw_topic: Option<String>,
    insight_topic: Option<String>,
    producer: Option<ProducerConfigFile>,
    consumer: Option<ConsumerConfigFile>,
    gateway: Option<GatewayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ProducerConfigFile {
    source: Option<String>,
    capture_window_secs: Option<u64>,
    cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ConsumerConfigFile {
    engine: Option<String>,
    prompt: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct GatewayConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub broker_addr: String,
    pub raw_topic: String,
    pub insight_topic: String,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub source: String,
    pub capture_window: Duration,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub engine: String,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub addr: String,
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("IRIS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let producer = ProducerSettings {
            source: file
                .producer
                .as_ref()
                .and_then(|p| p.source.clone())
                .unwrap_or_else(|| DEFAULT_CAPTURE_SOURCE.to_string()),
            capture_window: Duration::from_secs(
                file.producer
                    .as_ref()
                    .and_then(|p| p.capture_window_secs)
                    .unwrap_or(DEFAULT_CAPTURE_WINDOW_SECS),
            ),
            cooldown: Duration::from_secs(
                file.producer
                    .as_ref()
                    .and_then(|p| p.cooldown_secs)
                    .unwrap_or(DEFAULT_COOLDOWN_SECS),
            ),
        };
        let consumer = ConsumerSettings {
            engine: file
                .consumer
                .as_ref()
                .and_then(|c| c.engine.clone())
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            prompt: file.consumer.and_then(|c| c.prompt),
        };
        let gateway = GatewaySettings {
            addr: file
                .gateway
                .and_then(|g| g.addr)
                .unwrap_or_else(|| DEFAULT_GATEWAY_ADDR.to_string()),
        };
        Self {
            broker_addr: file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            raw_topic: file.raw_topic.unwrap_or_else(|| DEFAULT_RAW_TOPIC.to_string()),
            insight_topic: file
                .insight_topic
                .unwrap_or_else(|| DEFAULT_INSIGHT_TOPIC.to_string()),
            producer,
            consumer,
            gateway,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("IRIS_BROKER_ADDR") {
            if !addr.trim().is_empty() {
                self.broker_addr = addr;
            }
        }
        if let Ok(topic) = std::env::var("IRIS_RAW_TOPIC") {
            if !topic.trim().is_empty() {
                self.raw_topic = topic;
            }
        }
        if let Ok(topic) = std::env::var("IRIS_INSIGHT_TOPIC") {
            if !topic.trim().is_empty() {
                self.insight_topic = topic;
            }
        }
        if let Ok(source) = std::env::var("IRIS_CAPTURE_SOURCE") {
            if !source.trim().is_empty() {
                self.producer.source = source;
            }
        }
        if let Ok(secs) = std::env::var("IRIS_CAPTURE_WINDOW_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("IRIS_CAPTURE_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.producer.capture_window = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("IRIS_COOLDOWN_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| anyhow!("IRIS_COOLDOWN_SECS must be an integer number of seconds"))?;
            self.producer.cooldown = Duration::from_secs(secs);
        }
        if let Ok(engine) = std::env::var("IRIS_ENGINE") {
            if !engine.trim().is_empty() {
                self.consumer.engine = engine;
            }
        }
        if let Ok(addr) = std::env::var("IRIS_GATEWAY_ADDR") {
            if !addr.trim().is_empty() {
                self.gateway.addr = addr;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        crate::bus::parse_broker_addr(&self.broker_addr)?;
        validate_topic(&self.raw_topic)?;
        validate_topic(&self.insight_topic)?;
        if self.raw_topic == self.insight_topic {
            return Err(anyhow!("raw and insight topics must differ"));
        }
        if self.producer.capture_window.is_zero() {
            return Err(anyhow!("capture window must be greater than zero"));
        }
        if self.producer.cooldown.is_zero() {
            return Err(anyhow!("cooldown must be greater than zero"));
        }
        Ok(())
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(anyhow!("topic must not be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(anyhow!("topic '{}' must not contain wildcards", topic));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = PipelineConfig::from_file(PipelineConfigFile::default());
        assert_eq!(cfg.broker_addr, DEFAULT_BROKER_ADDR);
        assert_eq!(cfg.raw_topic, "camera/feed");
        assert_eq!(cfg.insight_topic, "llm/insight");
        assert_eq!(cfg.producer.capture_window, Duration::from_secs(5));
        assert_eq!(cfg.producer.cooldown, Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let file: PipelineConfigFile = serde_json::from_str(
            r#"{
                "broker_addr": "127.0.0.1:2883",
                "producer": {"source": "file:///tmp/frame.jpg", "cooldown_secs": 10},
                "gateway": {"addr": "127.0.0.1:9000"}
            }"#,
        )
        .expect("parse");
        let cfg = PipelineConfig::from_file(file);
        assert_eq!(cfg.broker_addr, "127.0.0.1:2883");
        assert_eq!(cfg.producer.source, "file:///tmp/frame.jpg");
        assert_eq!(cfg.producer.cooldown, Duration::from_secs(10));
        assert_eq!(cfg.gateway.addr, "127.0.0.1:9000");
        assert_eq!(cfg.insight_topic, "llm/insight");
    }

    #[test]
    fn wildcard_topics_are_rejected() {
        let mut cfg = PipelineConfig::from_file(PipelineConfigFile::default());
        cfg.raw_topic = "camera/#".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn identical_topics_are_rejected() {
        let mut cfg = PipelineConfig::from_file(PipelineConfigFile::default());
        cfg.insight_topic = cfg.raw_topic.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_cooldown_is_rejected() {
        let mut cfg = PipelineConfig::from_file(PipelineConfigFile::default());
        cfg.producer.cooldown = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
