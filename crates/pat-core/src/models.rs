//! Data models for pat: iteration results and the samples folded from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timing for one step inside an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub command: String,
    #[serde(with = "nanos")]
    pub duration: Duration,
}

/// Outcome of running a workload once.
///
/// `steps` holds every step that ran, in order, including the one that failed.
/// `duration` covers the first step's start up to the point execution stopped.
#[derive(Debug, Default)]
pub struct IterationResult {
    pub duration: Duration,
    pub steps: Vec<StepResult>,
    pub error: Option<anyhow::Error>,
}

impl IterationResult {
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// What caused a sample to be emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    /// An iteration finished.
    #[default]
    Result,
    /// The number of live lanes changed.
    Worker,
}

impl std::fmt::Display for SampleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleType::Result => write!(f, "result"),
            SampleType::Worker => write!(f, "worker"),
        }
    }
}

/// One running-aggregate point of an experiment.
///
/// Durations serialize as integer nanoseconds so a stored sample reads back
/// exactly. Keys are PascalCase (`TotalTime`, `LastError`, `Type`) and a
/// missing `LastError` is left out of the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sample {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(with = "nanos")]
    pub total_time: Duration,
    pub total: u64,
    pub total_errors: u64,
    pub total_workers: usize,
    #[serde(with = "nanos")]
    pub last_result: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(with = "nanos")]
    pub worst_result: Duration,
    #[serde(with = "nanos")]
    pub average: Duration,
    #[serde(with = "nanos")]
    pub wall_time: Duration,
    #[serde(rename = "Type", default)]
    pub sample_type: SampleType,
}

impl Sample {
    /// Fold an iteration into the aggregate that preceded it.
    pub fn record(
        &self,
        result: &IterationResult,
        total_workers: usize,
        wall_time: Duration,
    ) -> Sample {
        let total = self.total + 1;
        let total_time = self.total_time + result.duration;
        Sample {
            timestamp: Some(Utc::now()),
            total_time,
            total,
            total_errors: self.total_errors + u64::from(result.is_err()),
            total_workers,
            last_result: result.duration,
            last_error: result.error.as_ref().map(|e| format!("{e:#}")),
            worst_result: self.worst_result.max(result.duration),
            average: average(total_time, total),
            wall_time,
            sample_type: SampleType::Result,
        }
    }

    /// The same aggregate, re-emitted because the live lane count changed.
    pub fn with_workers(&self, total_workers: usize, wall_time: Duration) -> Sample {
        Sample {
            timestamp: Some(Utc::now()),
            total_workers,
            wall_time,
            sample_type: SampleType::Worker,
            ..self.clone()
        }
    }

    pub fn is_error(&self) -> bool {
        self.last_error.is_some()
    }
}

fn average(total_time: Duration, total: u64) -> Duration {
    if total == 0 {
        return Duration::ZERO;
    }
    let nanos = total_time.as_nanos() / u128::from(total);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Serde adapter storing a `Duration` as whole nanoseconds.
pub(crate) mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iteration(millis: u64, error: Option<&str>) -> IterationResult {
        IterationResult {
            duration: Duration::from_millis(millis),
            steps: vec![],
            error: error.map(|e| anyhow::anyhow!(e.to_string())),
        }
    }

    #[test]
    fn record_folds_running_aggregate() {
        let first = Sample::default().record(&iteration(300, None), 2, Duration::from_secs(1));
        assert_eq!(first.total, 1);
        assert_eq!(first.total_errors, 0);
        assert_eq!(first.total_workers, 2);
        assert_eq!(first.average, Duration::from_millis(300));
        assert_eq!(first.worst_result, Duration::from_millis(300));
        assert!(first.timestamp.is_some());

        let second = first.record(&iteration(100, Some("push failed")), 3, Duration::from_secs(2));
        assert_eq!(second.total, 2);
        assert_eq!(second.total_errors, 1);
        assert_eq!(second.total_workers, 3);
        assert_eq!(second.last_result, Duration::from_millis(100));
        assert_eq!(second.last_error.as_deref(), Some("push failed"));
        assert_eq!(second.worst_result, Duration::from_millis(300));
        assert_eq!(second.total_time, Duration::from_millis(400));
        assert_eq!(second.average, Duration::from_millis(200));
        assert_eq!(second.wall_time, Duration::from_secs(2));
        assert_eq!(second.sample_type, SampleType::Result);
    }

    #[test]
    fn a_successful_iteration_clears_last_error() {
        let failed = Sample::default().record(&iteration(10, Some("nope")), 1, Duration::ZERO);
        let ok = failed.record(&iteration(10, None), 1, Duration::ZERO);
        assert!(failed.is_error());
        assert!(!ok.is_error());
        assert_eq!(ok.total_errors, 1);
    }

    #[test]
    fn with_workers_keeps_totals() {
        let s = Sample::default().record(&iteration(10, None), 1, Duration::ZERO);
        let w = s.with_workers(4, Duration::from_secs(3));
        assert_eq!(w.total, s.total);
        assert_eq!(w.total_time, s.total_time);
        assert_eq!(w.total_workers, 4);
        assert_eq!(w.sample_type, SampleType::Worker);
    }

    #[test]
    fn missing_error_is_absent_from_json() {
        let s = Sample::default().record(&iteration(5, None), 1, Duration::ZERO);
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("LastError").is_none());
        assert_eq!(json["LastResult"], serde_json::json!(5_000_000u64));
        assert_eq!(json["TotalWorkers"], serde_json::json!(1));
        assert_eq!(json["Type"], serde_json::json!("result"));

        let back: Sample = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
