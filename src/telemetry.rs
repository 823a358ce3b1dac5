use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geo::Coordinate;
use crate::resolver::ProviderAttempt;

const JOURNAL_FILE: &str = "geocode-events.jsonl";
const PREVIOUS_JOURNAL_FILE: &str = "geocode-events.1.jsonl";

/// Pipeline events worth keeping after the process exits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GeocodeEvent {
    CacheSeeded {
        cache_entries: usize,
        seeded_entries: usize,
        db_recovered: bool,
    },
    Resolved {
        address: String,
        provider: Option<String>,
        coordinate: Coordinate,
        elapsed_ms: u64,
    },
    Unresolved {
        address: String,
        attempts: Vec<ProviderAttempt>,
    },
    QueueDrained {
        resolved: u64,
        unresolved: u64,
        cache_entries: usize,
    },
}

#[derive(Debug, Serialize)]
struct JournalLine<'a> {
    at: DateTime<Utc>,
    version: &'static str,
    #[serde(flatten)]
    event: &'a GeocodeEvent,
}

/// JSONL journal in the data directory. Events are buffered in memory and
/// appended in batches; when the file would exceed its cap the current
/// file becomes the single previous generation.
pub struct EventJournal {
    enabled: bool,
    buffered: Mutex<Vec<(DateTime<Utc>, GeocodeEvent)>>,
    path: PathBuf,
    batch_size: usize,
    max_bytes: u64,
}

impl EventJournal {
    pub fn open(data_dir: &Path, config: &AppConfig) -> AppResult<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            enabled: config.telemetry_enabled,
            buffered: Mutex::new(Vec::new()),
            path,
            batch_size: config.telemetry_batch_size.max(1),
            max_bytes: config.telemetry_buffer_max_bytes,
        })
    }

    pub fn record(&self, event: GeocodeEvent) -> AppResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut buffered = self.buffered.lock();
        buffered.push((Utc::now(), event));
        if buffered.len() >= self.batch_size {
            self.append(&mut buffered)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut buffered = self.buffered.lock();
        self.append(&mut buffered)
    }

    pub fn buffered(&self) -> usize {
        self.buffered.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, buffered: &mut Vec<(DateTime<Utc>, GeocodeEvent)>) -> AppResult<()> {
        if buffered.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::new();
        for (at, event) in buffered.iter() {
            let line = JournalLine {
                at: *at,
                version: env!("CARGO_PKG_VERSION"),
                event,
            };
            serde_json::to_writer(&mut lines, &line)?;
            lines.push(b'\n');
        }

        let on_disk = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if on_disk > 0 && on_disk + lines.len() as u64 > self.max_bytes {
            debug!(path = %self.path.display(), on_disk, "rotating geocode event journal");
            fs::rename(&self.path, self.path.with_file_name(PREVIOUS_JOURNAL_FILE))?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&lines)?;
        writer.flush()?;
        buffered.clear();
        Ok(())
    }
}
