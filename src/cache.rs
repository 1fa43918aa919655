//! Latest-value cache for the gateway.
//!
//! One entry per tracked topic, holding the most recent successfully
//! decoded payload. The bus delivery thread writes; any number of HTTP
//! threads read. A new entry is constructed in full before it becomes
//! visible under the write lock, so readers can never observe a torn
//! entry (artifact bytes from one message, media type from another).
//!
//! Failed decodes never revert or partially fill an entry.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::bus::Message;
use crate::envelope::Envelope;

/// How payloads on a topic are decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicSchema {
    /// JSON envelope with a base64 artifact (raw frame topics).
    Envelope,
    /// Plain UTF-8 text (insight topics).
    Text,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedValue {
    Artifact { bytes: Vec<u8>, media_type: String },
    Text(String),
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub last_updated: SystemTime,
}

/// Cloneable handle; all clones share the same entries.
#[derive(Clone)]
pub struct LatestStateCache {
    inner: Arc<Inner>,
}

struct Inner {
    schemas: HashMap<String, TopicSchema>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl LatestStateCache {
    pub fn new(topics: impl IntoIterator<Item = (String, TopicSchema)>) -> Self {
        Self {
            inner: Arc::new(Inner {
                schemas: topics.into_iter().collect(),
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Topics this cache tracks, for wiring up bus subscriptions.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.inner.schemas.keys().map(|topic| topic.as_str())
    }

    /// Decode one message per its topic's schema and, only on success,
    /// replace that topic's entry. An envelope without an artifact decodes
    /// successfully but updates nothing. An error means the message was
    /// dropped and the cache is unchanged.
    pub fn apply(&self, msg: &Message) -> Result<()> {
        let Some(schema) = self.inner.schemas.get(&msg.topic) else {
            log::debug!("cache ignoring untracked topic {}", msg.topic);
            return Ok(());
        };

        let value = match schema {
            TopicSchema::Envelope => {
                let envelope = Envelope::from_payload(&msg.payload)?;
                match envelope.artifact_bytes()? {
                    Some(bytes) => CachedValue::Artifact {
                        media_type: envelope.media_type_or_default().to_string(),
                        bytes,
                    },
                    None => {
                        log::debug!("envelope on {} carries no artifact", msg.topic);
                        return Ok(());
                    }
                }
            }
            TopicSchema::Text => {
                let text = std::str::from_utf8(&msg.payload)
                    .context("payload is not valid UTF-8")?;
                CachedValue::Text(text.to_string())
            }
        };

        let entry = CacheEntry {
            value,
            last_updated: msg.arrived_at,
        };
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(msg.topic.clone(), entry);
        Ok(())
    }

    /// Snapshot of the latest entry for a topic. `None` until the first
    /// successful decode on that topic.
    pub fn read(&self, topic: &str) -> Option<CacheEntry> {
        let entries = self
            .inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(topic).cloned()
    }
}
