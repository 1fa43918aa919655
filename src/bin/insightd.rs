//! insightd - inference daemon.
//!
//! Subscribes to the raw topic, runs the configured inference engine on
//! every frame envelope, and republishes the resulting text to the insight
//! topic. A bad message is dropped with a logged reason; the daemon keeps
//! listening until SIGINT.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use irispipe::bus::{parse_broker_addr, BusClient, BusConfig};
use irispipe::config::PipelineConfig;
use irispipe::consumer::{InsightConsumer, InsightConsumerConfig};
use irispipe::inference::select_engine;

const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Derive text insights from published frames")]
struct Args {
    /// Inference engine spec (stub:// or stub://<custom reply>).
    #[arg(long, env = "IRIS_ENGINE")]
    engine: Option<String>,

    /// MQTT broker address.
    #[arg(long, env = "IRIS_BROKER_ADDR")]
    broker_addr: Option<String>,

    /// Topic carrying frame envelopes.
    #[arg(long, env = "IRIS_RAW_TOPIC")]
    raw_topic: Option<String>,

    /// Topic insights are published to.
    #[arg(long, env = "IRIS_INSIGHT_TOPIC")]
    insight_topic: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load()?;
    if let Some(engine) = args.engine {
        cfg.consumer.engine = engine;
    }
    if let Some(addr) = args.broker_addr {
        cfg.broker_addr = addr;
    }
    if let Some(topic) = args.raw_topic {
        cfg.raw_topic = topic;
    }
    if let Some(topic) = args.insight_topic {
        cfg.insight_topic = topic;
    }

    let (host, port) = parse_broker_addr(&cfg.broker_addr)?;
    let engine = select_engine(&cfg.consumer.engine)
        .with_context(|| format!("unusable inference engine {}", cfg.consumer.engine))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        shutdown_signal.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let mut consumer_cfg = InsightConsumerConfig {
        raw_topic: cfg.raw_topic.clone(),
        insight_topic: cfg.insight_topic,
        ..InsightConsumerConfig::default()
    };
    if let Some(prompt) = cfg.consumer.prompt {
        consumer_cfg.prompt = prompt;
    }
    let mut consumer = InsightConsumer::new(consumer_cfg, engine);

    let bus = BusClient::connect(&BusConfig::new(host, port, "insightd"))?;
    let sender = bus.sender();
    bus.on_message(Box::new(move |msg| consumer.handle_message(msg, &sender)));
    bus.subscribe(&cfg.raw_topic)?;

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(IDLE_POLL);
    }

    bus.disconnect()?;
    Ok(())
}
