//! Sync progress narration.
//!
//! Reports observable progress during `cvx sync` so users see which course
//! is being walked, how many items are left, and how much has been stored.
//! Progress is emitted on **stderr** so stdout remains parseable for
//! scripts. Durable progress (the row other processes poll) lives in
//! [`crate::sync`]; these reporters are display only.

use std::io::Write;

/// A single progress event emitted by the sync driver.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Starting to walk one course.
    CourseStarted {
        name: String,
        index: u64,
        total: u64,
    },
    /// One module item read (narration line from the walker).
    ItemRead {
        message: String,
        index: u64,
        total: u64,
    },
    /// One material stored; counters are per-course cumulative.
    MaterialStored {
        course_materials: u64,
        course_chunks: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress: "sync course 2/7 'Biology 101'".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::CourseStarted { name, index, total } => {
                format!("sync course {}/{}  {}\n", index + 1, total, name)
            }
            SyncProgressEvent::ItemRead {
                message,
                index,
                total,
            } => {
                format!("  [{} / {}] {}\n", index + 1, total, message)
            }
            SyncProgressEvent::MaterialStored {
                course_materials,
                course_chunks,
            } => {
                format!(
                    "  stored {} materials / {} chunks\n",
                    format_number(*course_materials),
                    format_number(*course_chunks)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::CourseStarted { name, index, total } => serde_json::json!({
                "event": "course",
                "name": name,
                "index": index,
                "total": total
            }),
            SyncProgressEvent::ItemRead {
                message,
                index,
                total,
            } => serde_json::json!({
                "event": "item",
                "message": message,
                "index": index,
                "total": total
            }),
            SyncProgressEvent::MaterialStored {
                course_materials,
                course_chunks,
            } => serde_json::json!({
                "event": "material",
                "course_materials": course_materials,
                "course_chunks": course_chunks
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
