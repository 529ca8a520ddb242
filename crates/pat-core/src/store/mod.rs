//! Append-only sample persistence.
//!
//! Every backend implements the same two traits: a [`Store`] hands out
//! [`SampleWriter`]s for new experiments and lists the ones it already has,
//! and each [`Experiment`] replays its samples in the order they were written.

mod file;
mod kv;

pub use file::FileStore;
pub use kv::{KvStore, ListConnection, MemoryLists, RedisConnection};

use tracing::warn;

use crate::error::Result;
use crate::models::Sample;

/// Upper bound on the samples returned by a single read.
pub const MAX_RESULTS: usize = 10_000;

pub trait Store: Send + Sync {
    /// Every known experiment, oldest first.
    fn load_all(&self) -> Result<Vec<Box<dyn Experiment>>>;

    /// One experiment by guid, wherever it sits in the index.
    fn get(&self, guid: &str) -> Result<Option<Box<dyn Experiment>>> {
        Ok(self.load_all()?.into_iter().find(|e| e.guid() == guid))
    }

    /// A sink appending samples under `guid`. The guid is added to the
    /// store's index the first time a writer is requested for it.
    fn writer(&self, guid: &str) -> Result<Box<dyn SampleWriter>>;
}

/// A persisted experiment.
pub trait Experiment: Send + Sync {
    fn guid(&self) -> &str;

    /// Samples in write order, at most [`MAX_RESULTS`] of them.
    fn get_data(&self) -> Result<Vec<Sample>>;
}

pub trait SampleWriter: Send {
    fn write(&mut self, sample: &Sample) -> Result<()>;
}

pub(crate) fn encode(sample: &Sample) -> Result<String> {
    Ok(serde_json::to_string(sample)?)
}

/// Decode stored entries, dropping any that no longer parse.
pub(crate) fn decode<'a>(guid: &str, entries: impl IntoIterator<Item = &'a str>) -> Vec<Sample> {
    entries
        .into_iter()
        .enumerate()
        .filter(|(_, raw)| !raw.trim().is_empty())
        .filter_map(|(i, raw)| match serde_json::from_str(raw) {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!(guid, entry = i, "Skipping unreadable sample: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::SampleType;

    pub fn sample(total: u64, error: Option<&str>) -> Sample {
        Sample {
            timestamp: None,
            total_time: Duration::from_nanos(8),
            total,
            total_errors: total / 2,
            total_workers: 5,
            last_result: Duration::from_millis(6),
            last_error: error.map(str::to_string),
            worst_result: Duration::from_secs(3),
            average: Duration::from_micros(9),
            wall_time: Duration::from_secs(2),
            sample_type: SampleType::Result,
        }
    }

    pub fn write(store: &dyn Store, guid: &str, samples: &[Sample]) {
        let mut writer = store.writer(guid).unwrap();
        for s in samples {
            writer.write(s).unwrap();
        }
    }

    /// Shared round-trip checks every backend has to pass.
    pub fn round_trips(store: &dyn Store) {
        let one = vec![sample(7, None), sample(9, Some("foo"))];
        let two = vec![sample(2, None)];
        let three = vec![sample(1, None), sample(2, None), sample(3, Some("bar: baz"))];
        write(store, "experiment-1", &one);
        write(store, "experiment-2", &two);
        write(store, "experiment-3", &three);

        let experiments = store.load_all().unwrap();
        let guids: Vec<_> = experiments.iter().map(|e| e.guid().to_string()).collect();
        assert_eq!(guids, vec!["experiment-1", "experiment-2", "experiment-3"]);

        assert_eq!(experiments[0].get_data().unwrap(), one);
        assert_eq!(experiments[1].get_data().unwrap(), two);
        assert_eq!(experiments[2].get_data().unwrap(), three);
        assert_eq!(
            experiments[2].get_data().unwrap()[2].last_error.as_deref(),
            Some("bar: baz")
        );
    }

    /// Asking for a second writer must not register the guid twice.
    pub fn registers_guid_once(store: &dyn Store) {
        write(store, "again", &[sample(1, None)]);
        write(store, "again", &[sample(2, None)]);

        let experiments = store.load_all().unwrap();
        assert_eq!(experiments.len(), 1);
        let totals: Vec<_> = experiments[0]
            .get_data()
            .unwrap()
            .iter()
            .map(|s| s.total)
            .collect();
        assert_eq!(totals, vec![1, 2]);
    }

    #[test]
    fn decode_skips_unreadable_entries() {
        let good = encode(&sample(1, None)).unwrap();
        let decoded = decode("g", [good.as_str(), "{not json", "", good.as_str()]);
        assert_eq!(decoded.len(), 2);
    }
}
