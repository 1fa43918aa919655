//! Publish/subscribe bus client.
//!
//! `BusClient` wraps a rumqttc v5 client and owns the background delivery
//! thread. Incoming messages are handed to a single registered handler,
//! one at a time, in arrival order. Connection loss is handled inside the
//! delivery thread: the iterator keeps retrying, and every ConnAck triggers
//! a re-subscribe of all tracked topics, so callers never have to manage
//! reconnects themselves.
//!
//! Publishing is fire-and-forget (QoS 0). A publish error means a local
//! failure (the client is shut down); remote delivery failure is not
//! observable on this bus.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 10;

/// A message as delivered to the registered handler. Immutable once built.
#[derive(Clone, Debug)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub arrived_at: SystemTime,
}

/// The publish seam used by the producer and consumer, so tests can
/// substitute a recorder for the real client.
pub trait BusPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Handler invoked once per received message, never concurrently with
/// itself. A returned error is logged and contained to that message.
pub type MessageHandler = Box<dyn FnMut(&Message) -> Result<()> + Send>;

#[derive(Clone, Debug)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl BusConfig {
    /// Build a config with a randomized client id suffix so multiple
    /// daemons built from the same prefix never collide on the broker.
    pub fn new(host: impl Into<String>, port: u16, client_id_prefix: &str) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id_with_nonce(client_id_prefix),
            keep_alive: DEFAULT_KEEP_ALIVE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

pub fn client_id_with_nonce(prefix: &str) -> String {
    format!("{}-{:04x}", prefix, rand::random::<u16>())
}

/// Parse a broker address of the form `host:port`, optionally prefixed
/// with an `mqtt://` or `tcp://` scheme. TLS schemes are rejected; this
/// pipeline assumes a trusted local broker.
pub fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported broker scheme: {}", other)),
        }
        remainder = rest;
    }

    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid broker address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing broker port in {}", addr))?;
        let port: u16 = port.parse().context("invalid broker port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing broker port in {}", addr))?;
    let port: u16 = port.parse().context("invalid broker port")?;
    Ok((host.to_string(), port))
}

/// Cheap cloneable publish handle, safe to move into a message handler.
#[derive(Clone)]
pub struct BusSender {
    client: Client,
}

impl BusPublisher for BusSender {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .with_context(|| format!("publish to {} failed locally", topic))?;
        Ok(())
    }
}

/// Bus client owning the broker connection and its delivery thread.
pub struct BusClient {
    client: Client,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    delivery: Option<JoinHandle<()>>,
}

impl BusClient {
    /// Start the client. Returns immediately; the broker connection
    /// completes (and re-completes after network loss) in the delivery
    /// thread.
    pub fn connect(cfg: &BusConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(cfg.keep_alive);
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, CHANNEL_CAPACITY);

        let handler: Arc<Mutex<Option<MessageHandler>>> = Arc::new(Mutex::new(None));
        let subscriptions = Arc::new(Mutex::new(BTreeSet::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let delivery = spawn_delivery_thread(
            connection,
            client.clone(),
            handler.clone(),
            subscriptions.clone(),
            connected.clone(),
            shutdown.clone(),
            cfg.reconnect_delay,
        );

        log::info!(
            "bus client {} connecting to {}:{}",
            cfg.client_id,
            cfg.host,
            cfg.port
        );

        Ok(Self {
            client,
            handler,
            subscriptions,
            connected,
            shutdown,
            delivery: Some(delivery),
        })
    }

    /// Register the message handler. Exactly one handler is supported;
    /// registering again replaces the previous one. Messages arriving
    /// before registration are dropped.
    pub fn on_message(&self, handler: MessageHandler) {
        let mut guard = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(handler);
    }

    /// Register interest in a topic. Idempotent: the topic is tracked and
    /// re-subscribed after every reconnect.
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.insert(topic.to_string());
        }
        if self.connected.load(Ordering::SeqCst) {
            self.client
                .subscribe(topic, QoS::AtMostOnce)
                .with_context(|| format!("subscribe to {} failed", topic))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publish handle usable from inside a message handler.
    pub fn sender(&self) -> BusSender {
        BusSender {
            client: self.client.clone(),
        }
    }

    /// Stop delivery and release the connection. Safe to call even if the
    /// broker was never reached.
    pub fn disconnect(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        // Fails when the connection never came up; the thread shuts down
        // from the flag in that case.
        let _ = self.client.disconnect();
        if let Some(join) = self.delivery.take() {
            join.join()
                .map_err(|_| anyhow!("bus delivery thread panicked"))?;
        }
        Ok(())
    }
}

impl BusPublisher for BusClient {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.sender().publish(topic, payload)
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_delivery_thread(
    mut connection: Connection,
    client: Client,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    reconnect_delay: Duration,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    log::info!("bus connected");
                    // Subscriptions do not survive a clean-start session;
                    // renew them on every (re)connect.
                    let topics: Vec<String> = {
                        let subs = subscriptions
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        subs.iter().cloned().collect()
                    };
                    for topic in topics {
                        if let Err(e) = client.subscribe(&topic, QoS::AtMostOnce) {
                            log::warn!("re-subscribe to {} failed: {}", topic, e);
                        } else {
                            log::debug!("subscribed to {}", topic);
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic.to_string(),
                        Err(e) => {
                            log::warn!("dropping message with non-utf8 topic: {}", e);
                            continue;
                        }
                    };
                    let message = Message {
                        topic,
                        payload: publish.payload.to_vec(),
                        arrived_at: SystemTime::now(),
                    };
                    let mut guard = handler
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    match guard.as_mut() {
                        Some(handle) => {
                            if let Err(e) = handle(&message) {
                                log::warn!(
                                    "message on {} dropped: {:#}",
                                    message.topic,
                                    e
                                );
                            }
                        }
                        None => {
                            log::debug!("no handler registered, dropping {}", message.topic)
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        log::warn!("bus disconnected: {}; retrying", e);
                    } else {
                        log::warn!("bus connection failed: {}; retrying", e);
                    }
                    std::thread::sleep(reconnect_delay);
                }
            }
        }
        connected.store(false, Ordering::SeqCst);
        log::info!("bus delivery stopped");
    })
}
