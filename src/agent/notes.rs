//! Agent Notes
//!
//! Session journal of what the agent did: tool executions, generator
//! responses, plans, execution reports and errors. Notes live in memory and,
//! when a directory is configured, are mirrored to
//! `<dir>/<session_id>/notes.json` after every write.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Kind of note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    ToolExecution,
    ModelResponse,
    Plan,
    Execution,
    Error,
    Summary,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolExecution => "tool_execution",
            Self::ModelResponse => "model_response",
            Self::Plan => "plan",
            Self::Execution => "execution",
            Self::Error => "error",
            Self::Summary => "summary",
        }
    }
}

/// A single journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub kind: NoteKind,
    pub timestamp: String,
    pub content: Value,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Journal {
    session_id: String,
    start_time: String,
    notes: Vec<Note>,
}

/// Aggregate view of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub start_time: String,
    pub end_time: String,
    pub total_notes: usize,
    pub note_kinds: BTreeMap<String, usize>,
    pub tool_executions: BTreeMap<String, usize>,
    pub model_responses: BTreeMap<String, usize>,
    pub errors: Vec<Value>,
}

/// Export format for [`AgentNotes::export`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Text,
}

/// Session journal shared by the dispatcher and executors
pub struct AgentNotes {
    journal: Mutex<Journal>,
    session_dir: Option<PathBuf>,
}

impl AgentNotes {
    /// A journal that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            journal: Mutex::new(Self::new_journal()),
            session_dir: None,
        }
    }

    /// A journal mirrored under `base_dir/<session_id>/`
    pub fn persistent(base_dir: &Path) -> Result<Self> {
        let journal = Self::new_journal();
        let session_dir = base_dir.join(&journal.session_id);
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("Failed to create notes dir {}", session_dir.display()))?;

        let notes = Self {
            journal: Mutex::new(journal),
            session_dir: Some(session_dir),
        };
        notes.flush(&notes.journal.lock())?;
        Ok(notes)
    }

    fn new_journal() -> Journal {
        let now = chrono::Local::now();
        Journal {
            // uuid suffix keeps concurrent sessions in the same second apart
            session_id: format!(
                "{}_{}",
                now.format("%Y%m%d_%H%M%S"),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            start_time: now.to_rfc3339(),
            notes: Vec::new(),
        }
    }

    pub fn session_id(&self) -> String {
        self.journal.lock().session_id.clone()
    }

    pub fn session_dir(&self) -> Option<&Path> {
        self.session_dir.as_deref()
    }

    /// Append a note and return its id
    pub fn add(&self, kind: NoteKind, content: Value) -> String {
        self.add_with_metadata(kind, content, Value::Object(Default::default()))
    }

    pub fn add_with_metadata(&self, kind: NoteKind, content: Value, metadata: Value) -> String {
        let mut journal = self.journal.lock();
        let id = format!("{}_{}", kind.as_str(), journal.notes.len() + 1);
        journal.notes.push(Note {
            id: id.clone(),
            kind,
            timestamp: chrono::Local::now().to_rfc3339(),
            content,
            metadata,
        });

        if let Err(e) = self.flush(&journal) {
            warn!("Failed to persist notes: {:#}", e);
        }
        id
    }

    fn flush(&self, journal: &Journal) -> Result<()> {
        let Some(dir) = &self.session_dir else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(journal)?;
        std::fs::write(dir.join("notes.json"), data).context("Failed to write notes.json")?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Note> {
        self.journal.lock().notes.iter().find(|n| n.id == id).cloned()
    }

    pub fn by_kind(&self, kind: NoteKind) -> Vec<Note> {
        self.journal
            .lock()
            .notes
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    /// Tool execution notes for one tool id
    pub fn tool_executions(&self, tool_id: &str) -> Vec<Note> {
        self.by_kind(NoteKind::ToolExecution)
            .into_iter()
            .filter(|n| n.content.get("tool_id").and_then(Value::as_str) == Some(tool_id))
            .collect()
    }

    pub fn errors(&self) -> Vec<Note> {
        self.by_kind(NoteKind::Error)
    }

    pub fn len(&self) -> usize {
        self.journal.lock().notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_summary(&self) -> SessionSummary {
        let journal = self.journal.lock();
        let mut summary = SessionSummary {
            session_id: journal.session_id.clone(),
            start_time: journal.start_time.clone(),
            end_time: chrono::Local::now().to_rfc3339(),
            total_notes: journal.notes.len(),
            note_kinds: BTreeMap::new(),
            tool_executions: BTreeMap::new(),
            model_responses: BTreeMap::new(),
            errors: Vec::new(),
        };

        for note in &journal.notes {
            *summary.note_kinds.entry(note.kind.as_str().to_string()).or_default() += 1;

            match note.kind {
                NoteKind::ToolExecution => {
                    if let Some(tool_id) = note.content.get("tool_id").and_then(Value::as_str) {
                        *summary.tool_executions.entry(tool_id.to_string()).or_default() += 1;
                    }
                }
                NoteKind::ModelResponse => {
                    if let Some(model) = note.content.get("model_name").and_then(Value::as_str) {
                        *summary.model_responses.entry(model.to_string()).or_default() += 1;
                    }
                }
                NoteKind::Error => summary.errors.push(note.content.clone()),
                _ => {}
            }
        }

        summary
    }

    /// Write an export file next to `notes.json` and return its path
    pub fn export(&self, format: ExportFormat) -> Result<PathBuf> {
        let dir = self
            .session_dir
            .as_ref()
            .context("Notes are not persisted; nothing to export to")?;
        let journal = self.journal.lock();

        let (path, body) = match format {
            ExportFormat::Json => (
                dir.join(format!("export_{}.json", journal.session_id)),
                serde_json::to_string_pretty(&*journal)?,
            ),
            ExportFormat::Text => {
                let mut s = String::new();
                writeln!(s, "Session ID: {}", journal.session_id)?;
                writeln!(s, "Start Time: {}", journal.start_time)?;
                writeln!(s, "Total Notes: {}\n", journal.notes.len())?;
                for note in &journal.notes {
                    writeln!(s, "Note ID: {}", note.id)?;
                    writeln!(s, "Type: {}", note.kind.as_str())?;
                    writeln!(s, "Timestamp: {}", note.timestamp)?;
                    writeln!(s, "Content: {}", serde_json::to_string_pretty(&note.content)?)?;
                    writeln!(s, "Metadata: {}", serde_json::to_string_pretty(&note.metadata)?)?;
                    writeln!(s, "{}", "-".repeat(80))?;
                }
                (dir.join(format!("export_{}.txt", journal.session_id)), s)
            }
        };

        std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
