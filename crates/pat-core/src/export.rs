//! CSV rendering of stored samples.

use std::io::Write;
use std::time::Duration;

use crate::error::Result;
use crate::models::Sample;

pub const CSV_HEADER: &str =
    "Average,TotalTime,Total,TotalErrors,TotalWorkers,LastResult,LastError,WorstResult,WallTime,Type";

/// Write `samples` as CSV, one row per sample. Durations are in seconds.
pub fn write_csv<W: Write>(samples: &[Sample], out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(CSV_HEADER.split(','))?;
    for s in samples {
        wtr.write_record([
            secs(s.average),
            secs(s.total_time),
            s.total.to_string(),
            s.total_errors.to_string(),
            s.total_workers.to_string(),
            secs(s.last_result),
            s.last_error.clone().unwrap_or_default(),
            secs(s.worst_result),
            secs(s.wall_time),
            s.sample_type.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn to_csv_string(samples: &[Sample]) -> Result<String> {
    let mut buf = Vec::new();
    write_csv(samples, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn secs(d: Duration) -> String {
    format!("{:.6}", d.as_secs_f64())
}
