// ABOUTME: Append-only run log writing events, metrics, and the execution log
// ABOUTME: Optionally mirrors every record to a line stream in the same order as the files

use crate::constants::{EVENTS_FILE, EXECUTION_LOG_FILE, METRICS_FILE};
use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Cloneable line writer shared by the run log mirror and protocol responses.
///
/// All clones write through one lock so records never interleave.
#[derive(Clone)]
pub struct StreamWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl StreamWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write one JSON value as a single line and flush
    pub fn write_message(&self, message: &Value) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("stream writer lock poisoned"))?;
        serde_json::to_writer(&mut *guard, message)?;
        guard.write_all(b"\n")?;
        guard.flush()
    }
}

/// In-memory byte sink for capturing a stream in tests and embedded workers
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        match self.0.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).to_string(),
            Err(_) => String::new(),
        }
    }

    /// Parsed JSON lines written so far
    pub fn lines(&self) -> Vec<Value> {
        self.contents()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("buffer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Session-scoped sink for `events.jsonl`, `metrics.jsonl`, and `osiris.log`
pub struct RunLog {
    session_id: String,
    dir: PathBuf,
    events: File,
    metrics: File,
    execution_log: File,
    mirror: Option<StreamWriter>,
}

impl RunLog {
    /// Open (or create) the three log files inside `dir`
    pub fn create(session_id: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            session_id: session_id.into(),
            events: open_append(&dir.join(EVENTS_FILE))?,
            metrics: open_append(&dir.join(METRICS_FILE))?,
            execution_log: open_append(&dir.join(EXECUTION_LOG_FILE))?,
            dir,
            mirror: None,
        })
    }

    /// Stream every event and metric to `mirror` as well as the files
    pub fn with_mirror(mut self, mirror: StreamWriter) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_FILE)
    }

    pub fn execution_log_path(&self) -> PathBuf {
        self.dir.join(EXECUTION_LOG_FILE)
    }

    /// Append an event; `data` object fields are flattened into the record
    pub fn event(&mut self, name: &str, data: Value) {
        let ts = timestamp();
        let mut record = Map::new();
        record.insert("ts".to_string(), Value::String(ts.clone()));
        record.insert("session".to_string(), Value::String(self.session_id.clone()));
        record.insert("event".to_string(), Value::String(name.to_string()));
        merge_fields(&mut record, &data);

        if let Err(e) = writeln!(self.events, "{}", Value::Object(record)) {
            warn!("Failed to append event {}: {}", name, e);
        }

        if let Some(mirror) = &self.mirror {
            let message = json!({"type": "event", "name": name, "timestamp": ts, "data": data});
            if let Err(e) = mirror.write_message(&message) {
                warn!("Failed to stream event {}: {}", name, e);
            }
        }
    }

    /// Append a metric; `tags` object fields are flattened into the record
    pub fn metric(&mut self, name: &str, value: impl Into<Value>, tags: Value) {
        let value = value.into();
        let ts = timestamp();
        let mut record = Map::new();
        record.insert("ts".to_string(), Value::String(ts.clone()));
        record.insert("session".to_string(), Value::String(self.session_id.clone()));
        record.insert("metric".to_string(), Value::String(name.to_string()));
        record.insert("value".to_string(), value.clone());
        merge_fields(&mut record, &tags);

        if let Err(e) = writeln!(self.metrics, "{}", Value::Object(record)) {
            warn!("Failed to append metric {}: {}", name, e);
        }

        if let Some(mirror) = &self.mirror {
            let mut data = Map::new();
            data.insert("value".to_string(), value);
            merge_fields(&mut data, &tags);
            let message = json!({"type": "metric", "name": name, "timestamp": ts, "data": data});
            if let Err(e) = mirror.write_message(&message) {
                warn!("Failed to stream metric {}: {}", name, e);
            }
        }
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.line("INFO", message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.line("WARN", message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.line("ERROR", message.as_ref());
    }

    fn line(&mut self, level: &str, message: &str) {
        if let Err(e) = writeln!(self.execution_log, "{} {} {}", timestamp(), level, message) {
            warn!("Failed to append to execution log: {}", e);
        }
    }

    /// Guarantee the metrics file exists even when nothing was recorded
    pub fn touch_metrics(&self) -> io::Result<()> {
        open_append(&self.metrics_path()).map(|_| ())
    }

    pub fn flush(&mut self) {
        for file in [&mut self.events, &mut self.metrics, &mut self.execution_log] {
            if let Err(e) = file.flush() {
                warn!("Failed to flush run log: {}", e);
            }
        }
    }
}

fn merge_fields(record: &mut Map<String, Value>, extra: &Value) {
    match extra {
        Value::Object(fields) => {
            for (key, value) in fields {
                record.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Value::Null => {}
        other => {
            record.insert("data".to_string(), other.clone());
        }
    }
}

/// Read a JSON-lines file, skipping blank and unparsable lines
pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    let file = File::open(path.as_ref())?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => records.push(value),
            Err(e) => debug!("Skipping corrupt JSONL line in {}: {}", path.as_ref().display(), e),
        }
    }
    Ok(records)
}
