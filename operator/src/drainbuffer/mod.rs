use crate::util::Error;
use chrono::{DateTime, SecondsFormat, Utc};
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

mod persistor;

pub use persistor::ConfigMapPersistor;

/// Cadence of the cleanup-then-persist background pass.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(20);

/// One successful drain per group: when it happened and how long the group
/// must stay quiet afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct DrainEntry {
    pub last_drain: DateTime<Utc>,
    pub drain_buffer: Duration,
}

/// Wire form of one cache entry inside the persisted JSON document.
#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    last_drain: String,
    drain_buffer: String,
}

type PersistedDoc = BTreeMap<String, PersistedEntry>;

/// When the group may next be drained.
fn cooldown_until(entry: &DrainEntry) -> Result<DateTime<Utc>, Error> {
    Ok(entry.last_drain + chrono::Duration::from_std(entry.drain_buffer)?)
}

/// Whether the group's cooldown has fully elapsed. Entries whose arithmetic
/// overflows are considered expired and get evicted.
fn expired(entry: &DrainEntry, now: DateTime<Utc>) -> bool {
    match cooldown_until(entry) {
        Ok(until) => until < now,
        Err(_) => true,
    }
}

fn encode(cache: &HashMap<String, DrainEntry>) -> Result<String, Error> {
    let doc: PersistedDoc = cache
        .iter()
        .map(|(group, entry)| {
            (
                group.clone(),
                PersistedEntry {
                    last_drain: entry.last_drain.to_rfc3339_opts(SecondsFormat::Secs, true),
                    drain_buffer: format!("{}s", entry.drain_buffer.as_secs()),
                },
            )
        })
        .collect();
    Ok(serde_json::to_string(&doc)?)
}

fn decode(blob: &str) -> Result<HashMap<String, DrainEntry>, Error> {
    let doc: PersistedDoc = serde_json::from_str(blob)?;
    let mut cache = HashMap::with_capacity(doc.len());
    for (group, entry) in doc {
        cache.insert(
            group,
            DrainEntry {
                last_drain: DateTime::parse_from_rfc3339(&entry.last_drain)?.with_timezone(&Utc),
                drain_buffer: parse_duration::parse(&entry.drain_buffer)?,
            },
        );
    }
    Ok(cache)
}

struct BufferState {
    initialized: bool,
    cache: HashMap<String, DrainEntry>,
}

struct Inner {
    state: RwLock<BufferState>,
    persistor: ConfigMapPersistor,
}

/// Per-group drain cooldown with a durable backing store.
///
/// Initialization is lazy: the first caller blocks on the persistor load,
/// later callers see the populated cache. The background pass never persists
/// before initialization so a restart cannot clobber the stored cache with an
/// empty one.
#[derive(Clone)]
pub struct DrainBuffer {
    inner: Arc<Inner>,
}

impl DrainBuffer {
    pub fn new(persistor: ConfigMapPersistor) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(BufferState {
                    initialized: false,
                    cache: HashMap::new(),
                }),
                persistor,
            }),
        }
    }

    async fn ensure_initialized(&self) -> Result<(), Error> {
        {
            let state = self.inner.state.read().await;
            if state.initialized {
                return Ok(());
            }
        }
        let mut state = self.inner.state.write().await;
        if state.initialized {
            return Ok(());
        }
        if let Some(blob) = self.inner.persistor.load().await? {
            state.cache = decode(&blob)?;
        }
        state.initialized = true;
        Ok(())
    }

    /// Records a successful drain: the group stays quiet for `duration`.
    pub async fn store_successful_drain(
        &self,
        group: &str,
        duration: Duration,
    ) -> Result<(), Error> {
        self.ensure_initialized().await?;
        let mut state = self.inner.state.write().await;
        state.cache.insert(
            group.to_string(),
            DrainEntry {
                last_drain: Utc::now(),
                drain_buffer: duration,
            },
        );
        Ok(())
    }

    /// When the group may next be drained; the zero time when the group has
    /// no recorded drain.
    pub async fn next_drain(&self, group: &str) -> Result<DateTime<Utc>, Error> {
        self.ensure_initialized().await?;
        let state = self.inner.state.read().await;
        match state.cache.get(group) {
            Some(entry) => cooldown_until(entry),
            None => Ok(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    /// Evicts fully elapsed entries. Takes the exclusive lock and releases it
    /// before the persist pass re-acquires shared — no lock upgrade.
    async fn cleanup(&self, now: DateTime<Utc>) {
        let mut state = self.inner.state.write().await;
        if !state.initialized {
            return;
        }
        state.cache.retain(|_, entry| !expired(entry, now));
    }

    /// Serializes the cache under the shared lock, then writes it out with no
    /// lock held at all.
    async fn persist(&self) -> Result<(), Error> {
        let blob = {
            let state = self.inner.state.read().await;
            if !state.initialized {
                return Ok(());
            }
            encode(&state.cache)?
        };
        self.inner.persistor.persist(blob).await
    }

    /// Background task: every 20 s evict expired entries, then persist the
    /// remainder. Persistor errors are logged and retried on the next tick.
    /// A final persist runs on clean shutdown.
    pub async fn run(&self, token: CancellationToken) {
        let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.cleanup(Utc::now()).await;
            if let Err(e) = self.persist().await {
                eprintln!(
                    "{}",
                    format!("⚠️ drain buffer persist failed (will retry): {}", e).yellow()
                );
            }
        }
        if let Err(e) = self.persist().await {
            eprintln!(
                "{}",
                format!("🛑 final drain buffer persist failed: {}", e).red()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn entry(last_drain: &str, buffer_secs: u64) -> DrainEntry {
        DrainEntry {
            last_drain: at(last_drain),
            drain_buffer: Duration::from_secs(buffer_secs),
        }
    }

    #[test]
    fn cooldown_is_last_drain_plus_buffer() {
        let e = entry("2026-03-01T12:00:00Z", 600);
        assert_eq!(cooldown_until(&e).unwrap(), at("2026-03-01T12:10:00Z"));
    }

    #[test]
    fn entries_expire_only_after_the_full_buffer() {
        let e = entry("2026-03-01T12:00:00Z", 600);
        assert!(!expired(&e, at("2026-03-01T12:05:00Z")));
        assert!(!expired(&e, at("2026-03-01T12:10:00Z")));
        assert!(expired(&e, at("2026-03-01T12:10:01Z")));
    }

    #[test]
    fn persisted_document_round_trips() {
        let mut cache = HashMap::new();
        cache.insert("us-east-1a".to_string(), entry("2026-03-01T12:00:00Z", 600));
        cache.insert("us-east-1b".to_string(), entry("2026-03-01T09:30:00Z", 3600));
        let blob = encode(&cache).unwrap();
        assert_eq!(decode(&blob).unwrap(), cache);
    }

    #[test]
    fn decode_accepts_human_duration_units() {
        let blob = r#"{"g1":{"last_drain":"2026-03-01T12:00:00Z","drain_buffer":"10m"}}"#;
        let cache = decode(blob).unwrap();
        assert_eq!(
            cache.get("g1"),
            Some(&entry("2026-03-01T12:00:00Z", 600))
        );
    }

    #[test]
    fn decode_rejects_mangled_timestamps() {
        let blob = r#"{"g1":{"last_drain":"noon","drain_buffer":"10m"}}"#;
        assert!(matches!(decode(blob), Err(Error::Chrono { .. })));
    }
}
