//! Local directory backend.
//!
//! Layout:
//! - `experiments.index`: one guid per line, in creation order
//! - `<guid>.jsonl`: one JSON-encoded sample per line, in write order

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{PatError, Result};
use crate::models::Sample;

use super::{decode, encode, Experiment, SampleWriter, Store, MAX_RESULTS};

const INDEX_FILE: &str = "experiments.index";

pub struct FileStore {
    dir: PathBuf,
    /// Serializes index updates between writers of this store.
    index_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            index_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn samples_path(&self, guid: &str) -> PathBuf {
        self.dir.join(format!("{guid}.jsonl"))
    }

    fn read_index(&self) -> Result<Vec<String>> {
        read_lines(&self.index_path(), usize::MAX)
    }
}

impl Store for FileStore {
    fn load_all(&self) -> Result<Vec<Box<dyn Experiment>>> {
        Ok(self
            .read_index()?
            .into_iter()
            .map(|guid| {
                Box::new(FileExperiment {
                    path: self.samples_path(&guid),
                    guid,
                }) as Box<dyn Experiment>
            })
            .collect())
    }

    fn writer(&self, guid: &str) -> Result<Box<dyn SampleWriter>> {
        if guid.is_empty() || guid.contains(['/', '\\', '\n']) {
            return Err(PatError::Other(format!("unusable experiment guid: {guid:?}")));
        }

        {
            let _guard = self
                .index_lock
                .lock()
                .map_err(|_| PatError::Other("file store index lock poisoned".into()))?;
            if !self.read_index()?.iter().any(|g| g == guid) {
                let mut index = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.index_path())?;
                writeln!(index, "{guid}")?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.samples_path(guid))?;
        Ok(Box::new(FileWriter { file }))
    }
}

struct FileExperiment {
    guid: String,
    path: PathBuf,
}

impl Experiment for FileExperiment {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn get_data(&self) -> Result<Vec<Sample>> {
        let lines = read_lines(&self.path, MAX_RESULTS)?;
        Ok(decode(&self.guid, lines.iter().map(String::as_str)))
    }
}

struct FileWriter {
    file: File,
}

impl SampleWriter for FileWriter {
    fn write(&mut self, sample: &Sample) -> Result<()> {
        let mut line = encode(sample)?;
        line.push('\n');
        // One write per sample keeps each line whole under O_APPEND.
        self.file.write_all(line.as_bytes())?;
        Ok(())
    }
}

fn read_lines(path: &Path, limit: usize) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut lines = vec![];
    for line in reader.lines().take(limit) {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}
