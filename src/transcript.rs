use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Screen,
    Response,
}

/// One line of the session record: either a screen shown to the model or
/// the model's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub turn: u32,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// The full record of one session, appended each turn and written out as
/// JSONL at the end, plus the free-form MEMORY notes the agent collected.
#[derive(Debug, Clone)]
pub struct SessionTranscript {
    pub started: DateTime<Utc>,
    pub records: Vec<TranscriptRecord>,
    pub memory_notes: Vec<String>,
}

impl SessionTranscript {
    pub fn new() -> Self {
        SessionTranscript {
            started: Utc::now(),
            records: Vec::new(),
            memory_notes: Vec::new(),
        }
    }

    pub fn add_screen(&mut self, turn: u32, text: &str) {
        self.records.push(TranscriptRecord {
            turn,
            kind: RecordKind::Screen,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_response(&mut self, turn: u32, text: &str) {
        self.records.push(TranscriptRecord {
            turn,
            kind: RecordKind::Response,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_memory_note(&mut self, note: &str) {
        self.memory_notes.push(note.to_string());
    }

    /// Render the transcript as plain text for the extraction prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            match record.kind {
                RecordKind::Screen => {
                    out.push_str(&format!("--- Screen (turn {}) ---\n{}\n", record.turn, record.text));
                }
                RecordKind::Response => {
                    out.push_str(&format!("--- Agent (turn {}) ---\n{}\n", record.turn, record.text));
                }
            }
        }
        out
    }

    fn timestamp_slug(&self) -> String {
        // colons don't survive every filesystem
        self.started.format("%Y-%m-%dT%H-%M-%SZ").to_string()
    }

    /// Write the JSONL record under the session directory, one object per
    /// line. Returns the written path.
    pub fn write_jsonl(&self, sessions_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(sessions_dir).with_context(|| {
            format!("Failed to create sessions directory: {}", sessions_dir.display())
        })?;

        let path = sessions_dir.join(format!("{}.jsonl", self.timestamp_slug()));
        let mut lines = String::new();
        for record in &self.records {
            lines.push_str(&serde_json::to_string(record).context("Failed to serialize transcript record")?);
            lines.push('\n');
        }

        std::fs::write(&path, lines)
            .with_context(|| format!("Failed to write transcript: {}", path.display()))?;
        Ok(path)
    }

    /// Write the extraction summary beside the JSONL record.
    pub fn write_summary(&self, sessions_dir: &Path, summary: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(sessions_dir).with_context(|| {
            format!("Failed to create sessions directory: {}", sessions_dir.display())
        })?;

        let path = sessions_dir.join(format!("{}.summary.md", self.timestamp_slug()));
        std::fs::write(&path, summary)
            .with_context(|| format!("Failed to write session summary: {}", path.display()))?;
        Ok(path)
    }
}

impl Default for SessionTranscript {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = SessionTranscript::new();
        transcript.add_screen(1, "Main Menu\n[M]essages [G]ames [Q]uit");
        transcript.add_response(1, "THINKING: checking messages\nKEY: m");
        transcript.add_screen(2, "Message Bases");

        let path = transcript.write_jsonl(dir.path()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: TranscriptRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.turn, 1);
        assert_eq!(first.kind, RecordKind::Screen);
        assert!(lines[0].contains("\"type\":\"screen\""));
    }

    #[test]
    fn test_screen_and_response_counts() {
        let mut transcript = SessionTranscript::new();
        for turn in 1..=4 {
            transcript.add_screen(turn, "screen");
            if turn % 2 == 0 {
                // ticks that short-circuit record no response
                transcript.add_response(turn, "KEY: enter");
            }
        }
        let screens = transcript
            .records
            .iter()
            .filter(|r| r.kind == RecordKind::Screen)
            .count();
        let responses = transcript
            .records
            .iter()
            .filter(|r| r.kind == RecordKind::Response)
            .count();
        assert_eq!(screens, 4);
        assert!(responses <= screens);
    }

    #[test]
    fn test_summary_written_beside_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = SessionTranscript::new();
        let jsonl = transcript.write_jsonl(dir.path()).unwrap();
        let summary = transcript.write_summary(dir.path(), "quiet night, nobody on").unwrap();
        assert_eq!(jsonl.parent(), summary.parent());
        assert!(summary.to_string_lossy().ends_with(".summary.md"));
    }
}
