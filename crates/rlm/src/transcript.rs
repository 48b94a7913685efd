//! Append-only JSONL transcript of everything observable about a task run.
//! Writes are serialized under a mutex and flushed per event so a crash
//! never loses acknowledged history. Writer I/O errors are fatal to the run;
//! events are never silently dropped.

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payloads (code, output, content, answers) are clipped to this many chars
/// before they hit the transcript.
pub const PAYLOAD_CAP: usize = 20_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskStart {
        dataset: String,
        task_id: String,
        query: String,
        query_len: usize,
        context_len: usize,
        model: String,
        recursive_model: String,
    },
    LlmResponse {
        dataset: String,
        task_id: String,
        depth: usize,
        iteration: usize,
        model_selected: String,
        elapsed_ms: u64,
        content: String,
    },
    LlmError {
        dataset: String,
        task_id: String,
        depth: usize,
        iteration: usize,
        elapsed_ms: u64,
        error: String,
    },
    ReplInput {
        dataset: String,
        task_id: String,
        code: String,
    },
    ReplOutput {
        dataset: String,
        task_id: String,
        output: String,
    },
    ReplError {
        dataset: String,
        task_id: String,
        error: String,
    },
    FinalParsed {
        dataset: String,
        task_id: String,
        answer: String,
    },
    TaskEnd {
        dataset: String,
        task_id: String,
        ok: bool,
        error: Option<String>,
    },
}

impl Event {
    fn clipped(mut self) -> Self {
        let clip = |text: &mut String| {
            if text.chars().count() > PAYLOAD_CAP {
                let mut clipped: String = text.chars().take(PAYLOAD_CAP).collect();
                clipped.push_str("...");
                *text = clipped;
            }
        };
        match &mut self {
            Event::TaskStart { query, .. } => clip(query),
            Event::LlmResponse { content, .. } => clip(content),
            Event::LlmError { error, .. } => clip(error),
            Event::ReplInput { code, .. } => clip(code),
            Event::ReplOutput { output, .. } => clip(output),
            Event::ReplError { error, .. } => clip(error),
            Event::FinalParsed { answer, .. } => clip(answer),
            Event::TaskEnd { error, .. } => {
                if let Some(error) = error {
                    clip(error);
                }
            }
        }
        self
    }
}

/// One transcript line: the event plus a wall-clock stamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

pub struct TranscriptWriter {
    sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl TranscriptWriter {
    /// Appends to `path`, creating it if needed.
    pub fn to_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Mutex::new(Some(Box::new(BufWriter::new(file)))),
        })
    }

    /// A writer that records into any sink; used by tests.
    pub fn to_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    /// A writer that drops everything, for runs without a transcript path.
    pub fn disabled() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    pub fn append(&self, event: Event) -> io::Result<()> {
        let record = Record {
            ts: Utc::now(),
            event: event.clipped(),
        };
        let mut guard = self.sink.lock().expect("transcript writer lock");
        let Some(sink) = guard.as_mut() else {
            return Ok(());
        };
        let line = serde_json::to_string(&record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;
        sink.flush()
    }
}

/// Reads a transcript back, skipping blank lines. Used by replay tooling.
pub fn read_records(path: impl AsRef<Path>) -> io::Result<Vec<Record>> {
    let file = std::fs::File::open(path)?;
    let mut records = Vec::new();
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn events_serialize_with_type_tag_and_ts() {
        let buf = SharedBuf::default();
        let writer = TranscriptWriter::to_sink(Box::new(buf.clone()));
        writer
            .append(Event::TaskStart {
                dataset: "ds".to_owned(),
                task_id: "t1".to_owned(),
                query: "q".to_owned(),
                query_len: 1,
                context_len: 10,
                model: "big".to_owned(),
                recursive_model: "small".to_owned(),
            })
            .unwrap();
        writer
            .append(Event::TaskEnd {
                dataset: "ds".to_owned(),
                task_id: "t1".to_owned(),
                ok: true,
                error: None,
            })
            .unwrap();
        let raw = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "task_start");
        assert_eq!(first["context_len"], 10);
        assert!(first["ts"].is_string());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "task_end");
        assert_eq!(second["ok"], true);
    }

    #[test]
    fn oversized_payloads_are_clipped() {
        let buf = SharedBuf::default();
        let writer = TranscriptWriter::to_sink(Box::new(buf.clone()));
        writer
            .append(Event::ReplOutput {
                dataset: "ds".to_owned(),
                task_id: "t1".to_owned(),
                output: "y".repeat(PAYLOAD_CAP * 2),
            })
            .unwrap();
        let raw = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        let output = parsed["output"].as_str().unwrap();
        assert_eq!(output.chars().count(), PAYLOAD_CAP + 3);
        assert!(output.ends_with("..."));
    }

    #[test]
    fn records_round_trip_through_reader() {
        let dir = std::env::temp_dir().join(format!("rlm-transcript-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let writer = TranscriptWriter::to_file(&dir).unwrap();
        writer
            .append(Event::ReplInput {
                dataset: "ds".to_owned(),
                task_id: "t1".to_owned(),
                code: "print(1)".to_owned(),
            })
            .unwrap();
        let records = read_records(&dir).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            &records[0].event,
            Event::ReplInput { code, .. } if code == "print(1)"
        ));
        let _ = std::fs::remove_file(&dir);
    }
}
