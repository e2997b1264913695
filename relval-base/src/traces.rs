//! Append-only journal of time-stamped textual entries, grouped by
//! category and rotated by calendar day.
//!
//! Adding is lock-free and transactional: entries accumulate in a queue
//! until `commit` drains them to the daily file, or `rollback` discards
//! them. A fresh file is opened when an entry's UTC date changes.

use crate::error::TracesError;
use chrono::{DateTime, NaiveDate, Utc};
use crossbeam_channel::{Receiver, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

// ─── Configuration ────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TracesConfig {
    /// Root directory of all trace output.
    pub root: PathBuf,
    /// Per-service subdirectory under the root.
    pub dir: String,
    /// File name prefix, ahead of the 10-char date.
    pub prefix: String,
    /// File name suffix when not compressed.
    pub suffix: String,
    pub disabled: bool,
    pub compressed: bool,
    /// File name suffix when compressed.
    #[serde(rename = "compressed.suffix")]
    pub compressed_suffix: String,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("traces"),
            dir: String::new(),
            prefix: String::new(),
            suffix: ".txt".to_string(),
            disabled: false,
            compressed: false,
            compressed_suffix: ".txt.gz".to_string(),
        }
    }
}

// ─── Entries and listeners ────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    pub stamp: DateTime<Utc>,
    pub thread: String,
    pub text: String,
}

impl TraceEntry {
    pub fn new(stamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            stamp,
            thread: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
            text: text.into(),
        }
    }
}

/// Observation hooks; `on_add_trace` may veto an entry.
pub trait TracesListener: Send + Sync {
    fn on_add_trace(&self, _entry: &TraceEntry) -> bool {
        true
    }

    fn on_commit_traces(&self, _entries: &[TraceEntry]) {}

    fn on_rollback_traces(&self, _discarded: usize) {}
}

// ─── Traces ───────────────────────────────────────────────────

struct Output {
    writer: Option<BufWriter<File>>,
    date: Option<NaiveDate>,
}

pub struct Traces {
    config: TracesConfig,
    directory: PathBuf,
    enabled: AtomicBool,
    sender: Sender<TraceEntry>,
    receiver: Receiver<TraceEntry>,
    output: Mutex<Output>,
    listeners: RwLock<Vec<Arc<dyn TracesListener>>>,
}

impl Traces {
    pub fn new(config: TracesConfig, category: &str) -> Self {
        let directory = config.root.join(&config.dir).join(category);
        let enabled = !config.disabled;
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            config,
            directory,
            enabled: AtomicBool::new(enabled),
            sender,
            receiver,
            output: Mutex::new(Output {
                writer: None,
                date: None,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn add_listener(&self, listener: Arc<dyn TracesListener>) {
        self.listeners.write().expect("listeners lock").push(listener);
    }

    /// Queues an entry for the next commit. Returns false when disabled or
    /// vetoed by a listener.
    pub fn add(&self, entry: TraceEntry) -> bool {
        if !self.is_enabled() {
            return false;
        }
        for listener in self.listeners.read().expect("listeners lock").iter() {
            if !listener.on_add_trace(&entry) {
                return false;
            }
        }
        self.sender.send(entry).expect("trace queue open");
        true
    }

    /// Writes every queued entry to its daily file, opening and closing
    /// files on midnight crossings. With compression on, each commit adds
    /// one gzip member per touched file.
    pub fn commit(&self) -> Result<(), TracesError> {
        let mut output = self.output.lock().expect("output lock");
        let entries: Vec<TraceEntry> = self.receiver.try_iter().collect();
        if entries.is_empty() {
            return Ok(());
        }
        for listener in self.listeners.read().expect("listeners lock").iter() {
            listener.on_commit_traces(&entries);
        }

        if self.config.compressed {
            self.commit_compressed(&entries)?;
        } else {
            for entry in &entries {
                let date = entry.stamp.date_naive();
                if output.date != Some(date) {
                    if let Some(mut writer) = output.writer.take() {
                        writer.flush()?;
                    }
                    let file = self.open(date, &self.config.suffix)?;
                    output.writer = Some(BufWriter::new(file));
                    output.date = Some(date);
                }
                let writer = output.writer.as_mut().expect("writer opened above");
                write_line(writer, entry)?;
            }
            if let Some(writer) = output.writer.as_mut() {
                writer.flush()?;
            }
        }
        debug!("committed {} trace entries", entries.len());
        Ok(())
    }

    /// Discards every queued entry.
    pub fn rollback(&self) {
        let _output = self.output.lock().expect("output lock");
        let discarded = self.receiver.try_iter().count();
        if discarded > 0 {
            for listener in self.listeners.read().expect("listeners lock").iter() {
                listener.on_rollback_traces(discarded);
            }
            debug!("rolled back {} trace entries", discarded);
        }
    }

    fn commit_compressed(&self, entries: &[TraceEntry]) -> Result<(), TracesError> {
        let mut index = 0;
        while index < entries.len() {
            let date = entries[index].stamp.date_naive();
            let end = entries[index..]
                .iter()
                .position(|entry| entry.stamp.date_naive() != date)
                .map(|offset| index + offset)
                .unwrap_or(entries.len());
            let file = self.open(date, &self.config.compressed_suffix)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            for entry in &entries[index..end] {
                write_line(&mut encoder, entry)?;
            }
            encoder.finish()?;
            index = end;
        }
        Ok(())
    }

    fn open(&self, date: NaiveDate, suffix: &str) -> Result<File, TracesError> {
        std::fs::create_dir_all(&self.directory)?;
        let name = format!("{}{}{}", self.config.prefix, date.format("%Y-%m-%d"), suffix);
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.directory.join(name))?)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

fn write_line(writer: &mut impl Write, entry: &TraceEntry) -> Result<(), TracesError> {
    writeln!(
        writer,
        "{}\t[{}]\t{}",
        entry.stamp.format("%Y-%m-%d %H:%M:%S%.6f"),
        entry.thread,
        entry.text
    )?;
    Ok(())
}
