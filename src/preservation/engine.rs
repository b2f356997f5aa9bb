//! Snapshot store with differential storage and integrity checking.
//!
//! Every snapshot records the MD5 of the full encoded state it represents.
//! Diff snapshots point at a base; restoring walks the chain back to a full
//! snapshot, replays the diffs, and re-checks the digest.

use super::codec::{self, Codec};
use super::diff::{self, StateDiff};
use crate::config::PreservationConfig;
use crate::{RelearnError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// A stored checkpoint
#[derive(Debug, Clone)]
struct ContextSnapshot {
    id: String,
    session_id: String,
    iteration_number: u32,
    created_at: DateTime<Utc>,
    /// Compressed full state, or compressed `StateDiff` when `is_diff`
    payload: Vec<u8>,
    /// Digest of the full encoded state, never of the diff
    checksum: String,
    original_size: u64,
    compression_ratio: f64,
    is_diff: bool,
    base_snapshot_id: Option<String>,
    /// Diffs between this snapshot and its full ancestor
    chain_depth: usize,
}

/// Snapshot details without the payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotMetadata {
    pub id: String,
    pub session_id: String,
    pub iteration_number: u32,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    pub original_size: u64,
    pub size_bytes: u64,
    pub compression_ratio: f64,
    pub is_diff: bool,
    pub base_snapshot_id: Option<String>,
}

/// Result of a successful `create_snapshot`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotReceipt {
    pub snapshot_id: String,
    pub success: bool,
    pub compression_ratio: f64,
    /// Stored (compressed) size
    pub size_bytes: u64,
    /// Encoded size before diffing and compression
    pub original_size: u64,
    pub is_diff: bool,
    pub elapsed_ms: u64,
}

/// Result of `restore_snapshot`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    pub snapshot_id: String,
    pub success: bool,
    pub state: Option<Value>,
    pub elapsed_ms: u64,
    /// `None` when checksum validation is disabled
    pub checksum_valid: Option<bool>,
    pub error: Option<String>,
}

/// Cache capacity figures
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_snapshots: usize,
    pub total_bytes: u64,
    pub avg_compression_ratio: f64,
    pub sessions: usize,
}

/// Context Preservation Engine
#[derive(Debug)]
pub struct ContextPreservationEngine {
    config: PreservationConfig,
    codec: Codec,
    /// All snapshots, keyed by snapshot id
    snapshots: RwLock<HashMap<String, ContextSnapshot>>,
    /// Latest snapshot per session
    latest: RwLock<HashMap<String, String>>,
    sequence: AtomicU64,
}

impl ContextPreservationEngine {
    pub fn new(config: PreservationConfig) -> Self {
        info!(
            "Initializing context preservation engine (compression: {}, differential: {}, checksums: {})",
            config.enable_compression,
            config.enable_differential_storage,
            config.checksum_validation
        );
        let codec = Codec::new(config.enable_compression, config.compression_level);
        Self {
            config,
            codec,
            snapshots: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PreservationConfig {
        &self.config
    }

    /// Checkpoint `state`, as a diff against `base_snapshot_id` when possible.
    ///
    /// Fails without storing anything when the encoded state is larger than
    /// the configured ceiling.
    pub async fn create_snapshot(
        &self,
        session_id: &str,
        iteration_number: u32,
        state: &Value,
        base_snapshot_id: Option<&str>,
    ) -> Result<SnapshotReceipt> {
        let start = Instant::now();
        let encoded = codec::encode_state(state)?;
        let original_size = encoded.len() as u64;

        let limit = self.config.max_snapshot_bytes();
        if original_size > limit {
            warn!(
                "Rejecting snapshot for session {} iteration {}: {} bytes exceeds {}",
                session_id, iteration_number, original_size, limit
            );
            return Err(RelearnError::SnapshotTooLarge {
                size: original_size,
                limit,
            });
        }

        let checksum = codec::digest(&encoded);
        let differential = match base_snapshot_id {
            Some(base_id) if self.config.enable_differential_storage => {
                self.diff_against(session_id, base_id, state).await
            }
            _ => None,
        };

        let (raw_payload, is_diff, base_snapshot_id, chain_depth) = match differential {
            Some((diff, base_id, depth)) => (serde_json::to_vec(&diff)?, true, Some(base_id), depth),
            None => (encoded.into_bytes(), false, None, 0),
        };
        let payload = self.codec.compress(&raw_payload)?;
        let compression_ratio = codec::compression_ratio(original_size as usize, payload.len());

        let snapshot_id = self.next_snapshot_id(session_id, iteration_number);
        let snapshot = ContextSnapshot {
            id: snapshot_id.clone(),
            session_id: session_id.to_string(),
            iteration_number,
            created_at: Utc::now(),
            checksum,
            original_size,
            compression_ratio,
            is_diff,
            base_snapshot_id,
            chain_depth,
            payload,
        };
        let size_bytes = snapshot.payload.len() as u64;

        self.snapshots
            .write()
            .await
            .insert(snapshot_id.clone(), snapshot);
        self.latest
            .write()
            .await
            .insert(session_id.to_string(), snapshot_id.clone());

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "Created snapshot {} ({} bytes, diff: {}, ratio: {:.2}) in {}ms",
            snapshot_id, size_bytes, is_diff, compression_ratio, elapsed_ms
        );

        Ok(SnapshotReceipt {
            snapshot_id,
            success: true,
            compression_ratio,
            size_bytes,
            original_size,
            is_diff,
            elapsed_ms,
        })
    }

    /// Rebuild the state a snapshot represents.
    ///
    /// An undecodable payload or a digest mismatch yields a failed outcome
    /// with `checksum_valid: Some(false)`; wrong data is never returned.
    /// Unknown snapshots and broken chains are errors.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<RestoreOutcome> {
        let start = Instant::now();
        let validate = self.config.checksum_validation;
        let snapshots = self.snapshots.read().await;

        let chain = resolve_chain(&snapshots, snapshot_id)?;
        let target = chain[0];

        let failed = |reason: String| {
            error!("Restore of snapshot {} failed: {}", snapshot_id, reason);
            RestoreOutcome {
                snapshot_id: snapshot_id.to_string(),
                success: false,
                state: None,
                elapsed_ms: start.elapsed().as_millis() as u64,
                checksum_valid: validate.then_some(false),
                error: Some(reason),
            }
        };

        let state = match self.replay(&chain) {
            Ok(state) => state,
            Err(RelearnError::Codec(reason)) => return Ok(failed(reason)),
            Err(e) => return Err(e),
        };

        if validate {
            let actual = codec::digest(&codec::encode_state(&state)?);
            if actual != target.checksum {
                return Ok(failed(format!(
                    "checksum mismatch: expected {}, got {}",
                    target.checksum, actual
                )));
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Restored snapshot {} through {} link(s) in {}ms",
            snapshot_id,
            chain.len(),
            elapsed_ms
        );

        Ok(RestoreOutcome {
            snapshot_id: snapshot_id.to_string(),
            success: true,
            state: Some(state),
            elapsed_ms,
            checksum_valid: validate.then_some(true),
            error: None,
        })
    }

    pub async fn snapshot_metadata(&self, snapshot_id: &str) -> Option<SnapshotMetadata> {
        self.snapshots
            .read()
            .await
            .get(snapshot_id)
            .map(|s| SnapshotMetadata {
                id: s.id.clone(),
                session_id: s.session_id.clone(),
                iteration_number: s.iteration_number,
                created_at: s.created_at,
                checksum: s.checksum.clone(),
                original_size: s.original_size,
                size_bytes: s.payload.len() as u64,
                compression_ratio: s.compression_ratio,
                is_diff: s.is_diff,
                base_snapshot_id: s.base_snapshot_id.clone(),
            })
    }

    /// Most recent snapshot created for a session
    pub async fn latest_snapshot(&self, session_id: &str) -> Option<String> {
        self.latest.read().await.get(session_id).cloned()
    }

    /// Evict every snapshot and the base pointer of a session.
    /// Returns how many snapshots were dropped.
    pub async fn clear_session(&self, session_id: &str) -> usize {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|_, s| s.session_id != session_id);
        let removed = before - snapshots.len();
        self.latest.write().await.remove(session_id);

        info!("Cleared {} snapshot(s) for session {}", removed, session_id);
        removed
    }

    pub async fn cache_stats(&self) -> CacheStats {
        let snapshots = self.snapshots.read().await;
        let total_snapshots = snapshots.len();
        if total_snapshots == 0 {
            return CacheStats::default();
        }

        let total_bytes = snapshots.values().map(|s| s.payload.len() as u64).sum();
        let avg_compression_ratio = snapshots
            .values()
            .map(|s| s.compression_ratio)
            .sum::<f64>()
            / total_snapshots as f64;
        let mut sessions: Vec<&str> = snapshots.values().map(|s| s.session_id.as_str()).collect();
        sessions.sort_unstable();
        sessions.dedup();

        CacheStats {
            total_snapshots,
            total_bytes,
            avg_compression_ratio,
            sessions: sessions.len(),
        }
    }

    /// Diff `state` against a base snapshot. `None` means "store in full":
    /// the base is missing, belongs to another session, sits at the end of a
    /// maximal chain, cannot be rebuilt, or either side is not a mapping.
    async fn diff_against(
        &self,
        session_id: &str,
        base_id: &str,
        state: &Value,
    ) -> Option<(StateDiff, String, usize)> {
        let snapshots = self.snapshots.read().await;
        let base = match snapshots.get(base_id) {
            Some(base) if base.session_id == session_id => base,
            Some(_) => {
                warn!("Base snapshot {} belongs to another session", base_id);
                return None;
            }
            None => {
                warn!("Base snapshot {} not found, storing full snapshot", base_id);
                return None;
            }
        };
        if base.chain_depth >= self.config.max_diff_chain {
            debug!("Diff chain at {} reached its limit, storing full snapshot", base_id);
            return None;
        }

        let base_state = match resolve_chain(&snapshots, base_id).and_then(|c| self.replay(&c)) {
            Ok(state) => state,
            Err(e) => {
                warn!("Cannot rebuild base snapshot {}: {}", base_id, e);
                return None;
            }
        };

        diff::compute_diff(&base_state, state).map(|d| (d, base_id.to_string(), base.chain_depth + 1))
    }

    /// Decode the full snapshot at the end of `chain` and apply each diff
    /// on the way back to its head.
    fn replay(&self, chain: &[&ContextSnapshot]) -> Result<Value> {
        let (root, diffs) = chain
            .split_last()
            .ok_or_else(|| RelearnError::BrokenDiffChain("empty chain".into()))?;

        let mut state: Value = self.codec.decode(&root.payload)?;
        for snapshot in diffs.iter().rev() {
            let diff: StateDiff = self.codec.decode(&snapshot.payload)?;
            state = diff::apply_diff(&state, &diff);
        }
        Ok(state)
    }

    fn next_snapshot_id(&self, session_id: &str, iteration_number: u32) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("snapshot_{}_{}_{}", session_id, iteration_number, seq)
    }
}

/// Snapshots from `snapshot_id` back to its full ancestor, head first
fn resolve_chain<'a>(
    snapshots: &'a HashMap<String, ContextSnapshot>,
    snapshot_id: &str,
) -> Result<Vec<&'a ContextSnapshot>> {
    let mut current = snapshots
        .get(snapshot_id)
        .ok_or_else(|| RelearnError::SnapshotNotFound(snapshot_id.to_string()))?;
    let mut chain = vec![current];

    while current.is_diff {
        let base_id = current.base_snapshot_id.as_deref().ok_or_else(|| {
            RelearnError::BrokenDiffChain(format!("diff snapshot {} has no base", current.id))
        })?;
        current = snapshots.get(base_id).ok_or_else(|| {
            RelearnError::BrokenDiffChain(format!(
                "base {} of snapshot {} is missing",
                base_id, current.id
            ))
        })?;
        chain.push(current);
        if chain.len() > snapshots.len() {
            return Err(RelearnError::BrokenDiffChain(format!(
                "cycle detected from snapshot {}",
                snapshot_id
            )));
        }
    }

    Ok(chain)
}
