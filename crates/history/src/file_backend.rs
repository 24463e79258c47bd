//! File-based history backend: one JSON-lines log per session.
//!
//! Each session lives in `<dir>/<session>.jsonl`; every line is one
//! JSON-encoded `Message`. Appends open the file in append mode and write a
//! single line, so a crash can at worst leave a truncated last line, which
//! is skipped on the next read.
//!
//! Storage location: `~/.loopwright/history/`

use async_trait::async_trait;
use loopwright_core::error::HistoryError;
use loopwright_core::history::HistoryStore;
use loopwright_core::message::{Message, SessionId};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const EXTENSION: &str = "jsonl";

/// A directory of JSONL session logs.
pub struct FileHistory {
    dir: PathBuf,
    /// Serializes writers so lines from concurrent appends never interleave
    write_lock: Mutex<()>,
}

impl FileHistory {
    /// Create a file-based store rooted at `dir`. The directory is created on
    /// first write.
    pub fn new(dir: PathBuf) -> Self {
        debug!(dir = %dir.display(), "File history backend opened");
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &SessionId) -> PathBuf {
        self.dir
            .join(format!("{}.{EXTENSION}", encode_session(session_id.as_str())))
    }

    fn parse_log(session_id: &SessionId, content: &str) -> Vec<Message> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<Message>(line) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(session_id = %session_id, line = n + 1, error = %e, "Skipping corrupted history line");
                    None
                }
            })
            .collect()
    }
}

/// Map a session id to a safe file stem. Bytes outside `[A-Za-z0-9_-]` are
/// written as `%XX` so the mapping is reversible.
fn encode_session(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_session(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl HistoryStore for FileHistory {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), HistoryError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| HistoryError::Serialization(format!("Failed to serialize message: {e}")))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            HistoryError::Storage(format!("Failed to create history directory: {e}"))
        })?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session_id))
            .await
            .map_err(|e| HistoryError::Storage(format!("Failed to open history file: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| HistoryError::Storage(format!("Failed to write history file: {e}")))?;
        file.flush()
            .await
            .map_err(|e| HistoryError::Storage(format!("Failed to flush history file: {e}")))?;
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> Result<Vec<Message>, HistoryError> {
        match tokio::fs::read_to_string(self.session_path(session_id)).await {
            Ok(content) => Ok(Self::parse_log(session_id, &content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(HistoryError::Storage(format!("Failed to read history file: {e}"))),
        }
    }

    async fn reset(&self, session_id: &SessionId) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.session_path(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HistoryError::Storage(format!("Failed to remove history file: {e}"))),
        }
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, HistoryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(HistoryError::Storage(format!(
                    "Failed to list history directory: {e}"
                )));
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| HistoryError::Storage(format!("Failed to list history directory: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_session)
            {
                ids.push(SessionId(id));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn append_and_reload_persists() {
        let dir = tempfile::tempdir().unwrap();
        let s = SessionId::from("session-1");

        let store = FileHistory::new(dir.path().to_path_buf());
        store.append(&s, &Message::user("hi")).await.unwrap();
        store.append(&s, &Message::assistant("hello")).await.unwrap();

        let reopened = FileHistory::new(dir.path().to_path_buf());
        let log = reopened.read(&s).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].text(), "hi");
        assert_eq!(log[1].text(), "hello");
    }

    #[tokio::test]
    async fn handles_missing_directory_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistory::new(dir.path().join("not-created-yet"));
        assert!(store.read(&SessionId::from("s")).await.unwrap().is_empty());
        assert!(store.sessions().await.unwrap().is_empty());
        store.reset(&SessionId::from("s")).await.unwrap();
    }

    #[tokio::test]
    async fn handles_corrupted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let s = SessionId::from("s");
        let store = FileHistory::new(dir.path().to_path_buf());
        store.append(&s, &Message::user("valid")).await.unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(store.session_path(&s))
            .unwrap();
        writeln!(file, "this is not json").unwrap();
        drop(file);

        store.append(&s, &Message::user("also valid")).await.unwrap();
        let log = store.read(&s).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].text(), "also valid");
    }

    #[tokio::test]
    async fn reset_removes_only_that_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistory::new(dir.path().to_path_buf());
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        store.append(&a, &Message::user("a")).await.unwrap();
        store.append(&b, &Message::user("b")).await.unwrap();

        store.reset(&a).await.unwrap();
        store.reset(&a).await.unwrap();

        assert!(store.read(&a).await.unwrap().is_empty());
        assert_eq!(store.sessions().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn unusual_session_ids_round_trip_through_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistory::new(dir.path().to_path_buf());
        let s = SessionId::from("team/alpha:42 ü");
        store.append(&s, &Message::user("x")).await.unwrap();
        assert_eq!(store.sessions().await.unwrap(), vec![s.clone()]);
        assert_eq!(store.read(&s).await.unwrap().len(), 1);
    }

    #[test]
    fn encoding_is_reversible() {
        let id = "a.b/c%d";
        assert_eq!(decode_session(&encode_session(id)).as_deref(), Some(id));
        assert_eq!(encode_session("plain_id-1"), "plain_id-1");
    }
}
