//! Session transcript.
//!
//! One append-only JSONL file per process invocation: a `session` header
//! line, then one `message` line per spoken turn. Write failures are logged
//! and never interrupt the pipeline.

use crate::error::Result;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Transcript schema version.
const TRANSCRIPT_VERSION: u32 = 3;

#[derive(Debug, Serialize)]
struct SessionHeader<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    version: u32,
    id: &'a str,
    timestamp: i64,
    cwd: String,
}

#[derive(Debug, Serialize)]
struct MessageLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    timestamp: i64,
    message: MessageBody<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    role: &'a str,
    content: Vec<TextBlock<'a>>,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct TextBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// Append-only per-session transcript writer.
pub struct SessionTranscript {
    path: PathBuf,
    session_id: String,
    last_message_id: Option<String>,
    file: Option<std::fs::File>,
}

impl SessionTranscript {
    /// Open a new transcript in `dir` and write the session header.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let path = dir.join(format!("session-{session_id}.jsonl"));
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;

        let mut transcript =
            Self { path, session_id, last_message_id: None, file: Some(file) };
        transcript.write_header();
        Ok(transcript)
    }

    /// The transcript file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn write_header(&mut self) {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let header = SessionHeader {
            kind: "session",
            version: TRANSCRIPT_VERSION,
            id: &self.session_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            cwd,
        };
        if let Ok(line) = serde_json::to_string(&header) {
            self.write_line(&line);
        }
    }

    /// Append one turn. Messages chain via `parentId`.
    pub fn append(&mut self, role: &str, text: &str, channel: Option<&str>) {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let line = MessageLine {
            kind: "message",
            id: &id,
            parent_id: self.last_message_id.as_deref(),
            timestamp: now,
            message: MessageBody {
                role,
                content: vec![TextBlock { kind: "text", text }],
                timestamp: now,
            },
            channel,
        };
        if let Ok(raw) = serde_json::to_string(&line) {
            self.write_line(&raw);
        }
        self.last_message_id = Some(id);
    }

    fn write_line(&mut self, line: &str) {
        let Some(file) = &mut self.file else {
            return;
        };
        if let Err(e) = writeln!(file, "{line}") {
            warn!("transcript write failed, disabling: {e}");
            self.file = None;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn header_then_chained_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = SessionTranscript::create(dir.path()).unwrap();
        transcript.append("user", "what time is it", Some("general"));
        transcript.append("assistant", "Half past nine.", Some("general"));

        let raw = std::fs::read_to_string(transcript.path()).unwrap();
        let lines: Vec<serde_json::Value> =
            raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);

        assert_eq!(lines[0]["type"], "session");
        assert_eq!(lines[0]["version"], 3);
        assert!(lines[0]["id"].as_str().is_some());
        assert!(lines[0]["cwd"].as_str().is_some());

        assert_eq!(lines[1]["type"], "message");
        assert_eq!(lines[1]["message"]["role"], "user");
        assert_eq!(lines[1]["message"]["content"][0]["type"], "text");
        assert_eq!(lines[1]["message"]["content"][0]["text"], "what time is it");
        assert!(lines[1].get("parentId").is_none());

        // The second message chains off the first.
        assert_eq!(lines[2]["parentId"], lines[1]["id"]);
        assert_eq!(lines[2]["channel"], "general");
    }

    #[test]
    fn distinct_sessions_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = SessionTranscript::create(dir.path()).unwrap();
        let b = SessionTranscript::create(dir.path()).unwrap();
        assert_ne!(a.path(), b.path());
        assert_ne!(a.session_id(), b.session_id());
    }
}
