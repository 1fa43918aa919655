//! gatewayd - latest-value gateway.
//!
//! Subscribes to the raw and insight topics, keeps the most recent value
//! of each, and serves them over a loopback HTTP reader. HTTP clients only
//! ever see the cache; they never touch the bus.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use irispipe::api::{ApiConfig, ApiServer};
use irispipe::bus::{parse_broker_addr, BusClient, BusConfig};
use irispipe::cache::{LatestStateCache, TopicSchema};
use irispipe::config::PipelineConfig;

const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the latest frame and insight over HTTP")]
struct Args {
    /// HTTP listen address.
    #[arg(long, env = "IRIS_GATEWAY_ADDR")]
    addr: Option<String>,

    /// MQTT broker address.
    #[arg(long, env = "IRIS_BROKER_ADDR")]
    broker_addr: Option<String>,

    /// Topic carrying frame envelopes.
    #[arg(long, env = "IRIS_RAW_TOPIC")]
    raw_topic: Option<String>,

    /// Topic carrying insight text.
    #[arg(long, env = "IRIS_INSIGHT_TOPIC")]
    insight_topic: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load()?;
    if let Some(addr) = args.addr {
        cfg.gateway.addr = addr;
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

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        shutdown_signal.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let cache = LatestStateCache::new([
        (cfg.raw_topic.clone(), TopicSchema::Envelope),
        (cfg.insight_topic.clone(), TopicSchema::Text),
    ]);

    let bus = BusClient::connect(&BusConfig::new(host, port, "gatewayd"))?;
    let handler_cache = cache.clone();
    bus.on_message(Box::new(move |msg| handler_cache.apply(msg)));
    for topic in cache.topics() {
        bus.subscribe(topic)?;
    }

    let api = ApiServer::new(
        ApiConfig {
            addr: cfg.gateway.addr,
            raw_topic: cfg.raw_topic,
            insight_topic: cfg.insight_topic,
            broker_addr: cfg.broker_addr,
        },
        cache,
    )
    .spawn()?;
    log::info!("gateway listening on {}", api.addr);

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(IDLE_POLL);
    }

    api.stop()?;
    bus.disconnect()?;
    Ok(())
}
