//! Pipeline scenarios wired through in-process fakes: producer output is
//! replayed as bus messages to the consumer and the gateway cache, the
//! same way the delivery thread would hand them over.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use irispipe::api::{ApiConfig, ApiServer};
use irispipe::bus::{BusPublisher, Message};
use irispipe::cache::{CachedValue, LatestStateCache, TopicSchema};
use irispipe::capture::open_capture_device;
use irispipe::consumer::{InsightConsumer, InsightConsumerConfig};
use irispipe::inference::StubEngine;
use irispipe::producer::{DutyCycle, DutyCycleConfig};

struct RecordingBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingBus {
    fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
        }
    }

    fn drain(&self) -> Vec<Message> {
        self.published
            .lock()
            .unwrap()
            .drain(..)
            .map(|(topic, payload)| Message {
                topic,
                payload,
                arrived_at: SystemTime::now(),
            })
            .collect()
    }
}

impl BusPublisher for RecordingBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

fn run_one_producer_cycle(bus: &RecordingBus) {
    let device = open_capture_device("stub://camera0").expect("stub device");
    let mut cycle = DutyCycle::new(
        DutyCycleConfig {
            capture_window: Duration::from_millis(50),
            cooldown: Duration::from_millis(1),
            read_pause: Duration::from_millis(1),
            ..DutyCycleConfig::default()
        },
        device,
    );
    cycle.step(bus); // open
    cycle.step(bus); // capture + publish
    assert_eq!(cycle.frames_published(), 1);
}

fn gateway_cache() -> LatestStateCache {
    LatestStateCache::new([
        ("camera/feed".to_string(), TopicSchema::Envelope),
        ("llm/insight".to_string(), TopicSchema::Text),
    ])
}

#[test]
fn frame_flows_from_producer_to_cache_and_insight() {
    let feed_bus = RecordingBus::new();
    run_one_producer_cycle(&feed_bus);
    let feed = feed_bus.drain();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].topic, "camera/feed");

    let cache = gateway_cache();
    let insight_bus = RecordingBus::new();
    let mut consumer = InsightConsumer::new(
        InsightConsumerConfig::default(),
        Box::new(StubEngine::default()),
    );

    // Gateway and consumer both receive the frame.
    cache.apply(&feed[0]).expect("cache frame");
    consumer
        .handle_message(&feed[0], &insight_bus)
        .expect("consume frame");

    let entry = cache.read("camera/feed").expect("frame cached");
    let CachedValue::Artifact { bytes, media_type } = entry.value else {
        panic!("frame topic should cache an artifact");
    };
    assert!(!bytes.is_empty());
    assert_eq!(media_type, "image/jpeg");

    // The insight the consumer produced reaches the cache the same way.
    let insights = insight_bus.drain();
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].topic, "llm/insight");
    cache.apply(&insights[0]).expect("cache insight");

    assert_eq!(
        cache.read("llm/insight").expect("insight cached").value,
        CachedValue::Text("face detected, neutral expression".to_string())
    );
}

#[test]
fn invalid_payload_stops_at_every_stage() {
    let garbage = Message {
        topic: "camera/feed".to_string(),
        payload: b"not an envelope".to_vec(),
        arrived_at: SystemTime::now(),
    };

    let cache = gateway_cache();
    assert!(cache.apply(&garbage).is_err());
    assert!(cache.read("camera/feed").is_none());

    let insight_bus = RecordingBus::new();
    let mut consumer = InsightConsumer::new(
        InsightConsumerConfig::default(),
        Box::new(StubEngine::default()),
    );
    assert!(consumer.handle_message(&garbage, &insight_bus).is_err());
    assert!(insight_bus.drain().is_empty());
    assert_eq!(consumer.dropped(), 1);
}

#[test]
fn gateway_serves_what_the_pipeline_produced() {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    let feed_bus = RecordingBus::new();
    run_one_producer_cycle(&feed_bus);
    let feed = feed_bus.drain();

    let cache = gateway_cache();
    cache.apply(&feed[0]).expect("cache frame");

    let insight_bus = RecordingBus::new();
    let mut consumer = InsightConsumer::new(
        InsightConsumerConfig::default(),
        Box::new(StubEngine::default()),
    );
    consumer
        .handle_message(&feed[0], &insight_bus)
        .expect("consume frame");
    for msg in insight_bus.drain() {
        cache.apply(&msg).expect("cache insight");
    }

    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        cache,
    )
    .spawn()
    .expect("spawn gateway");

    let mut stream = TcpStream::connect(api.addr).expect("connect");
    stream
        .write_all(
            format!(
                "GET /latest_insight HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                api.addr
            )
            .as_bytes(),
        )
        .expect("request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("response");
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("face detected, neutral expression"));

    api.stop().expect("stop gateway");
}
