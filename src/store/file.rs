//! JSON file store.
//!
//! Directory layout:
//!   {root}/sessions/{session_id}.json     one pretty-printed session
//!   {root}/iterations/{session_id}.jsonl  one iteration per line, appended
//!   {root}/patterns.json                  every error pattern, keyed by id
//!
//! Files that fail to parse are logged and treated as absent.

use super::LearningStore;
use crate::model::{ErrorCategory, ErrorPattern, LearningIteration, LearningSession, SessionUpdate};
use crate::{RelearnError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct FileLearningStore {
    sessions_dir: PathBuf,
    iterations_dir: PathBuf,
    patterns_path: PathBuf,
    /// Serializes read-modify-write cycles on session and pattern files
    write_lock: Mutex<()>,
}

impl FileLearningStore {
    /// Open a store rooted at `root`, creating its directories if needed.
    pub async fn new(root: &Path) -> Result<Self> {
        let sessions_dir = root.join("sessions");
        let iterations_dir = root.join("iterations");
        fs::create_dir_all(&sessions_dir).await?;
        fs::create_dir_all(&iterations_dir).await?;
        info!("Opened learning store at {}", root.display());

        Ok(Self {
            sessions_dir,
            iterations_dir,
            patterns_path: root.join("patterns.json"),
            write_lock: Mutex::new(()),
        })
    }

    /// List all stored session ids.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                match name.strip_suffix(".json").and_then(decode_id) {
                    Some(session_id) => sessions.push(session_id),
                    None => warn!("Ignoring unexpected file {} in sessions", name),
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    async fn read_session(&self, session_id: &str) -> Result<Option<LearningSession>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<LearningSession>(&content) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Failed to parse session file for {}: {}", session_id, e);
                Ok(None)
            }
        }
    }

    async fn write_session(&self, session: &LearningSession) -> Result<()> {
        let content = serde_json::to_string_pretty(session)?;
        write_file(&self.session_path(&session.id), content.as_bytes()).await?;
        debug!("Saved session {}", session.id);
        Ok(())
    }

    async fn read_patterns(&self) -> Result<BTreeMap<String, ErrorPattern>> {
        if !self.patterns_path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&self.patterns_path).await?;
        match serde_json::from_str(&content) {
            Ok(patterns) => Ok(patterns),
            Err(e) => {
                warn!("Failed to parse {}: {}", self.patterns_path.display(), e);
                Ok(BTreeMap::new())
            }
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.json", encode_id(session_id)))
    }

    fn iterations_path(&self, session_id: &str) -> PathBuf {
        self.iterations_dir
            .join(format!("{}.jsonl", encode_id(session_id)))
    }
}

#[async_trait]
impl LearningStore for FileLearningStore {
    async fn create_session(&self, session: &LearningSession) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_session(session).await
    }

    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .read_session(session_id)
            .await?
            .ok_or_else(|| RelearnError::SessionNotFound(session_id.to_string()))?;
        update.apply_to(&mut session)?;
        self.write_session(&session).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<LearningSession>> {
        self.read_session(session_id).await
    }

    async fn create_iteration(&self, iteration: &LearningIteration) -> Result<()> {
        let line = serde_json::to_string(iteration)?;
        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.iterations_path(&iteration.session_id))
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list_iterations(&self, session_id: &str) -> Result<Vec<LearningIteration>> {
        let path = self.iterations_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        // A retried append leaves a duplicate line; the last copy wins.
        let content = fs::read_to_string(&path).await?;
        let mut by_id: HashMap<String, LearningIteration> = HashMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LearningIteration>(line) {
                Ok(iteration) => {
                    by_id.insert(iteration.id.clone(), iteration);
                }
                Err(e) => warn!("Skipping unreadable iteration in {}: {}", path.display(), e),
            }
        }

        let mut iterations: Vec<LearningIteration> = by_id.into_values().collect();
        iterations.sort_by_key(|i| i.iteration_number);
        Ok(iterations)
    }

    async fn get_error_patterns(
        &self,
        category: Option<ErrorCategory>,
    ) -> Result<Vec<ErrorPattern>> {
        Ok(self
            .read_patterns()
            .await?
            .into_values()
            .filter(|p| category.map_or(true, |c| p.category == c))
            .collect())
    }

    async fn upsert_error_pattern(&self, pattern: &ErrorPattern) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut patterns = self.read_patterns().await?;
        patterns.insert(pattern.id.clone(), pattern.clone());
        let content = serde_json::to_string_pretty(&patterns)?;
        write_file(&self.patterns_path, content.as_bytes()).await
    }
}

async fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(content).await?;
    file.flush().await?;
    Ok(())
}

/// Encode an id as a file name.
///
/// ASCII alphanumerics and `-` pass through; every other byte becomes `%XX`,
/// so distinct ids never share a file.
fn encode_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

/// Inverse of `encode_id`; `None` for names it could not have produced
fn decode_id(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = name.get(i + 1..i + 3)?;
                if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return None;
                }
                decoded.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            byte if byte.is_ascii_alphanumeric() || byte == b'-' => {
                decoded.push(byte);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionSettings, SessionStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn session(id: &str) -> LearningSession {
        LearningSession::new(
            id.into(),
            "task".into(),
            "agent".into(),
            SessionSettings {
                quality_threshold: 0.8,
                min_iterations: 1,
                max_iterations: 3,
                enable_error_recognition: true,
                enable_adaptive_prompting: true,
            },
            0.2,
        )
    }

    fn pattern(id: &str, category: ErrorCategory) -> ErrorPattern {
        let now = Utc::now();
        ErrorPattern {
            id: id.into(),
            category,
            pattern: "file at PATH not found".into(),
            frequency: 1,
            confidence: 0.7,
            first_detected: now,
            last_seen: now,
            remediation_strategy: category.remediation().into(),
            success_count: 0,
            success_rate: 0.0,
            examples: vec!["file at /a not found".into()],
        }
    }

    #[tokio::test]
    async fn test_session_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = FileLearningStore::new(dir.path()).await.unwrap();
        store.create_session(&session("s/1")).await.unwrap();
        store
            .update_session("s/1", &SessionUpdate::status(SessionStatus::Active))
            .await
            .unwrap();

        let reopened = FileLearningStore::new(dir.path()).await.unwrap();
        let loaded = reopened.get_session("s/1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.quality_score, 0.2);
        assert_eq!(reopened.list_sessions().await.unwrap(), vec!["s/1".to_string()]);
    }

    #[tokio::test]
    async fn test_similar_ids_keep_separate_files() {
        let dir = TempDir::new().unwrap();
        let store = FileLearningStore::new(dir.path()).await.unwrap();
        store.create_session(&session("s/1")).await.unwrap();
        store.create_session(&session("s_1")).await.unwrap();
        store
            .update_session("s/1", &SessionUpdate::status(SessionStatus::Active))
            .await
            .unwrap();

        let slash = store.get_session("s/1").await.unwrap().unwrap();
        let underscore = store.get_session("s_1").await.unwrap().unwrap();
        assert_eq!(slash.id, "s/1");
        assert_eq!(slash.status, SessionStatus::Active);
        assert_eq!(underscore.id, "s_1");
        assert_eq!(underscore.status, SessionStatus::Initializing);
        assert_eq!(
            store.list_sessions().await.unwrap(),
            vec!["s/1".to_string(), "s_1".to_string()]
        );
        assert_eq!(decode_id(&encode_id("é %2F")).as_deref(), Some("é %2F"));
    }

    #[tokio::test]
    async fn test_completed_session_cannot_reopen() {
        let dir = TempDir::new().unwrap();
        let store = FileLearningStore::new(dir.path()).await.unwrap();
        store.create_session(&session("s1")).await.unwrap();
        for status in [SessionStatus::Active, SessionStatus::Completed] {
            store
                .update_session("s1", &SessionUpdate::status(status))
                .await
                .unwrap();
        }
        assert!(store
            .update_session("s1", &SessionUpdate::status(SessionStatus::Active))
            .await
            .is_err());

        let reopened = FileLearningStore::new(dir.path()).await.unwrap();
        let loaded = reopened.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_corrupt_session_file_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = FileLearningStore::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("sessions").join("bad.json"), "{not json").unwrap();
        assert!(store.get_session("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patterns_upsert_and_filter() {
        let dir = TempDir::new().unwrap();
        let store = FileLearningStore::new(dir.path()).await.unwrap();
        store
            .upsert_error_pattern(&pattern("p1", ErrorCategory::TypeError))
            .await
            .unwrap();
        store
            .upsert_error_pattern(&pattern("p2", ErrorCategory::SyntaxError))
            .await
            .unwrap();
        let mut updated = pattern("p1", ErrorCategory::TypeError);
        updated.frequency = 5;
        store.upsert_error_pattern(&updated).await.unwrap();

        assert_eq!(store.get_error_patterns(None).await.unwrap().len(), 2);
        let types = store
            .get_error_patterns(Some(ErrorCategory::TypeError))
            .await
            .unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].frequency, 5);
    }
}
