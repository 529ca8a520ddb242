//! Key-value list backend.
//!
//! One list (`experiments`) holds every guid in creation order and one list
//! per guid (`experiment.<guid>`) holds its JSON-encoded samples. Anything
//! that can append to and slice a named list of strings can back it: a Redis
//! server through [`RedisConnection`], or [`MemoryLists`] in-process.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{PatError, Result};
use crate::models::Sample;

use super::{decode, encode, Experiment, SampleWriter, Store, MAX_RESULTS};

const INDEX_KEY: &str = "experiments";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn samples_key(guid: &str) -> String {
    format!("experiment.{guid}")
}

/// The two list commands the store needs.
///
/// `start` and `stop` are inclusive and may count back from the end of the
/// list with negative values, as `LRANGE` does.
pub trait ListConnection: Send {
    fn rpush(&mut self, key: &str, value: &str) -> Result<()>;
    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
}

/// A store over a single shared connection.
///
/// All writers and readers go through one mutex, so appends from concurrent
/// lanes reach the backend one at a time.
pub struct KvStore<C> {
    conn: Arc<Mutex<C>>,
}

impl<C: ListConnection> KvStore<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

fn lock<C>(conn: &Arc<Mutex<C>>) -> Result<MutexGuard<'_, C>> {
    conn.lock()
        .map_err(|_| PatError::Other("store connection lock poisoned".into()))
}

impl<C: ListConnection + 'static> Store for KvStore<C> {
    /// The first [`MAX_RESULTS`] experiments; later ones are reachable
    /// through [`Store::get`].
    fn load_all(&self) -> Result<Vec<Box<dyn Experiment>>> {
        let guids = lock(&self.conn)?.lrange(INDEX_KEY, 0, MAX_RESULTS as isize - 1)?;
        Ok(guids
            .into_iter()
            .map(|guid| {
                Box::new(KvExperiment {
                    conn: self.conn.clone(),
                    guid,
                }) as Box<dyn Experiment>
            })
            .collect())
    }

    fn get(&self, guid: &str) -> Result<Option<Box<dyn Experiment>>> {
        let mut conn = lock(&self.conn)?;
        let known = !conn.lrange(&samples_key(guid), 0, 0)?.is_empty()
            || conn.lrange(INDEX_KEY, 0, -1)?.iter().any(|g| g == guid);
        Ok(known.then(|| {
            Box::new(KvExperiment {
                conn: self.conn.clone(),
                guid: guid.to_string(),
            }) as Box<dyn Experiment>
        }))
    }

    fn writer(&self, guid: &str) -> Result<Box<dyn SampleWriter>> {
        let mut conn = lock(&self.conn)?;
        let known = conn.lrange(INDEX_KEY, 0, -1)?;
        if !known.iter().any(|g| g == guid) {
            conn.rpush(INDEX_KEY, guid)?;
        }
        Ok(Box::new(KvWriter {
            conn: self.conn.clone(),
            key: samples_key(guid),
        }))
    }
}

struct KvExperiment<C> {
    conn: Arc<Mutex<C>>,
    guid: String,
}

impl<C: ListConnection> Experiment for KvExperiment<C> {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn get_data(&self) -> Result<Vec<Sample>> {
        let raw = lock(&self.conn)?.lrange(&samples_key(&self.guid), 0, MAX_RESULTS as isize - 1)?;
        Ok(decode(&self.guid, raw.iter().map(String::as_str)))
    }
}

struct KvWriter<C> {
    conn: Arc<Mutex<C>>,
    key: String,
}

impl<C: ListConnection> SampleWriter for KvWriter<C> {
    fn write(&mut self, sample: &Sample) -> Result<()> {
        let encoded = encode(sample)?;
        lock(&self.conn)?.rpush(&self.key, &encoded)
    }
}

// ─── Redis ───────────────────────────────────────────────────────────────────

/// A synchronous connection to a Redis server.
pub struct RedisConnection {
    conn: redis::Connection,
}

impl RedisConnection {
    /// Connect (and authenticate, when a password is given) to `host:port`.
    ///
    /// Unreachable hosts and rejected credentials both fail here rather than
    /// on the first write.
    pub fn connect(host: &str, port: u16, password: Option<&str>) -> Result<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                password: password.filter(|p| !p.is_empty()).map(str::to_string),
                ..Default::default()
            },
        };
        Self::open(info)
    }

    /// Connect using a `redis://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let info = redis::IntoConnectionInfo::into_connection_info(url)
            .map_err(|e| PatError::Connection(e.to_string()))?;
        Self::open(info)
    }

    fn open(info: redis::ConnectionInfo) -> Result<Self> {
        let client = redis::Client::open(info).map_err(|e| PatError::Connection(e.to_string()))?;
        let mut conn = client
            .get_connection_with_timeout(CONNECT_TIMEOUT)
            .map_err(|e| PatError::Connection(e.to_string()))?;
        redis::cmd("PING")
            .query::<()>(&mut conn)
            .map_err(|e| PatError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

impl ListConnection for RedisConnection {
    fn rpush(&mut self, key: &str, value: &str) -> Result<()> {
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query::<()>(&mut self.conn)?;
        Ok(())
    }

    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query(&mut self.conn)?)
    }
}

// ─── In-process lists ────────────────────────────────────────────────────────

/// In-memory lists with `LRANGE` semantics.
///
/// Clones share the same data, so several stores can see one "server".
#[derive(Clone, Default)]
pub struct MemoryLists {
    lists: Arc<DashMap<String, Vec<String>>>,
}

impl MemoryLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// Overwrite one element, for simulating damaged entries.
    pub fn set(&self, key: &str, index: usize, value: &str) {
        if let Some(mut list) = self.lists.get_mut(key) {
            if let Some(slot) = list.get_mut(index) {
                *slot = value.to_string();
            }
        }
    }
}

impl ListConnection for MemoryLists {
    fn rpush(&mut self, key: &str, value: &str) -> Result<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let Some(list) = self.lists.get(key) else {
            return Ok(vec![]);
        };
        let len = list.len() as isize;
        let resolve = |i: isize| if i < 0 { len + i } else { i };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(vec![]);
        }
        Ok(list[start as usize..=stop as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{registers_guid_once, round_trips, sample, write};

    #[test]
    fn round_trips_experiments_and_samples() {
        round_trips(&KvStore::new(MemoryLists::new()));
    }

    #[test]
    fn registers_each_guid_once() {
        registers_guid_once(&KvStore::new(MemoryLists::new()));
    }

    #[test]
    fn uses_index_and_per_guid_lists() {
        let lists = MemoryLists::new();
        let store = KvStore::new(lists.clone());
        write(&store, "abc", &[sample(1, None), sample(2, None)]);

        assert_eq!(lists.len("experiments"), 1);
        assert_eq!(lists.len("experiment.abc"), 2);
    }

    #[test]
    fn lrange_follows_redis_semantics() {
        let mut lists = MemoryLists::new();
        for v in ["a", "b", "c", "d"] {
            lists.rpush("k", v).unwrap();
        }
        assert_eq!(lists.lrange("k", 0, -1).unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(lists.lrange("k", 1, 2).unwrap(), vec!["b", "c"]);
        assert_eq!(lists.lrange("k", -2, -1).unwrap(), vec!["c", "d"]);
        assert_eq!(lists.lrange("k", 0, 100).unwrap().len(), 4);
        assert!(lists.lrange("k", 3, 1).unwrap().is_empty());
        assert!(lists.lrange("missing", 0, -1).unwrap().is_empty());
    }

    #[test]
    fn nulls_out_unreadable_samples() {
        let lists = MemoryLists::new();
        let store = KvStore::new(lists.clone());
        write(&store, "g", &[sample(1, None), sample(2, None), sample(3, None)]);
        lists.set("experiment.g", 1, "not a sample");

        let data = store.load_all().unwrap()[0].get_data().unwrap();
        let totals: Vec<_> = data.iter().map(|s| s.total).collect();
        assert_eq!(totals, vec![1, 3]);
    }

    #[test]
    fn caps_reads_at_max_results() {
        let store = KvStore::new(MemoryLists::new());
        let mut writer = store.writer("big").unwrap();
        for i in 0..(MAX_RESULTS as u64 + 3) {
            writer.write(&sample(i, None)).unwrap();
        }
        let data = store.load_all().unwrap()[0].get_data().unwrap();
        assert_eq!(data.len(), MAX_RESULTS);
        assert_eq!(data.last().unwrap().total, MAX_RESULTS as u64 - 1);
    }

    #[test]
    fn finds_experiments_past_the_listing_window() {
        let mut lists = MemoryLists::new();
        for i in 0..MAX_RESULTS {
            lists.rpush("experiments", &format!("old-{i}")).unwrap();
        }
        let store = KvStore::new(lists);
        write(&store, "newest", &[sample(1, None)]);

        let listed = store.load_all().unwrap();
        assert_eq!(listed.len(), MAX_RESULTS);
        assert!(listed.iter().all(|e| e.guid() != "newest"));

        let found = store.get("newest").unwrap().expect("newest is stored");
        assert_eq!(found.get_data().unwrap(), vec![sample(1, None)]);
        assert!(store.get("old-3").unwrap().is_some());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn concurrent_writers_do_not_interleave_guids() {
        let lists = MemoryLists::new();
        let store = Arc::new(KvStore::new(lists.clone()));
        let handles: Vec<_> = (0..4)
            .map(|lane| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut writer = store.writer(&format!("lane-{lane}")).unwrap();
                    for i in 0..50 {
                        writer.write(&sample(i, None)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let experiments = store.load_all().unwrap();
        assert_eq!(experiments.len(), 4);
        for e in experiments {
            let totals: Vec<_> = e.get_data().unwrap().iter().map(|s| s.total).collect();
            assert_eq!(totals, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn connect_fails_for_unreachable_host() {
        let err = RedisConnection::connect("127.0.0.1", 1, None)
            .err()
            .expect("nothing listens on port 1");
        assert!(matches!(err, PatError::Connection(_)));
    }

    /// Runs against a live server only when `REDIS_URL` is set.
    #[test]
    fn redis_round_trip() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            tracing::info!("REDIS_URL not set; skipping Redis round trip");
            return;
        };
        let mut conn = RedisConnection::from_url(&url).unwrap();
        redis::cmd("FLUSHDB").query::<()>(&mut conn.conn).unwrap();
        round_trips(&KvStore::new(conn));
    }
}
