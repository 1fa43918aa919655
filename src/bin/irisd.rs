//! irisd - capture daemon.
//!
//! Opens the configured capture source on a duty cycle and publishes at
//! most one frame envelope per cycle to the raw topic. Runs until SIGINT.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use irispipe::bus::{parse_broker_addr, BusClient, BusConfig};
use irispipe::capture::open_capture_device;
use irispipe::config::PipelineConfig;
use irispipe::producer::{DutyCycle, DutyCycleConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture frames on a duty cycle and publish them")]
struct Args {
    /// Capture source (stub://<name> or file://<path>).
    #[arg(long, env = "IRIS_CAPTURE_SOURCE")]
    source: Option<String>,

    /// MQTT broker address.
    #[arg(long, env = "IRIS_BROKER_ADDR")]
    broker_addr: Option<String>,

    /// Topic to publish frame envelopes to.
    #[arg(long, env = "IRIS_RAW_TOPIC")]
    topic: Option<String>,

    /// Capture window per cycle, in seconds.
    #[arg(long, env = "IRIS_CAPTURE_WINDOW_SECS")]
    capture_window_secs: Option<u64>,

    /// Cooldown between cycles, in seconds.
    #[arg(long, env = "IRIS_COOLDOWN_SECS")]
    cooldown_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load()?;
    if let Some(source) = args.source {
        cfg.producer.source = source;
    }
    if let Some(addr) = args.broker_addr {
        cfg.broker_addr = addr;
    }
    if let Some(topic) = args.topic {
        cfg.raw_topic = topic;
    }
    if let Some(secs) = args.capture_window_secs {
        cfg.producer.capture_window = Duration::from_secs(secs);
    }
    if let Some(secs) = args.cooldown_secs {
        cfg.producer.cooldown = Duration::from_secs(secs);
    }

    let (host, port) = parse_broker_addr(&cfg.broker_addr)?;
    let device = open_capture_device(&cfg.producer.source)
        .with_context(|| format!("unusable capture source {}", cfg.producer.source))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        shutdown_signal.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let bus = BusClient::connect(&BusConfig::new(host, port, "irisd"))?;

    let mut cycle = DutyCycle::new(
        DutyCycleConfig {
            topic: cfg.raw_topic,
            capture_window: cfg.producer.capture_window,
            cooldown: cfg.producer.cooldown,
            ..DutyCycleConfig::default()
        },
        device,
    );
    cycle.run(&bus, &shutdown);

    bus.disconnect()?;
    Ok(())
}
