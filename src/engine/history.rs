//! JSONL-backed conversation history, one file per session key.
//!
//! Each session is a single `sessions/<key>.jsonl` file of serialized
//! [`ChatMessage`]s. Session keys contain `:` separators; they are
//! sanitised for the filesystem.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::providers::ChatMessage;

/// Persistent per-session message history.
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn file_for(&self, session_key: &str) -> PathBuf {
        let safe: String = session_key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Append one message to the session's file, creating it and the
    /// parent directory if necessary.
    pub async fn append(&self, session_key: &str, message: &ChatMessage) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context("create sessions dir")?;

        let path = self.file_for(session_key);
        let line = serde_json::to_string(message).context("serialize message")?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open history file {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;

        debug!(session_key, role = %message.role, "history appended");
        Ok(())
    }

    /// Load up to `limit` most-recent messages. Missing file yields an
    /// empty history; malformed lines are skipped.
    pub async fn load(&self, session_key: &str, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
        let path = self.file_for(session_key);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };

        let mut messages: Vec<ChatMessage> = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(line) {
                Ok(m) => messages.push(m),
                Err(e) => debug!(error = %e, "skipping malformed history line"),
            }
        }

        if messages.len() > limit {
            messages = messages.split_off(messages.len() - limit);
        }
        Ok(messages)
    }

    /// Replace a session's history wholesale (compaction rewrite).
    pub async fn replace(
        &self,
        session_key: &str,
        messages: &[ChatMessage],
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context("create sessions dir")?;
        let path = self.file_for(session_key);
        let mut lines = String::new();
        for m in messages {
            lines.push_str(&serde_json::to_string(m).context("serialize message")?);
            lines.push('\n');
        }
        fs::write(&path, lines)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}
