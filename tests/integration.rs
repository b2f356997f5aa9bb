//! Integration tests for Relearn

use pretty_assertions::assert_eq;
use relearn::{
    BudgetIterationManager, ContextPreservationEngine, ErrorCategory, ErrorPatternRecognizer,
    FileLearningStore, InMemoryLearningStore, IterationContext, LearningConfig, LearningStore,
    LearningTask, MultiTurnLearningCoordinator, SessionOptions, SessionStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn counting_task(task_id: &str, per_step: u64) -> LearningTask {
    LearningTask::new(
        task_id,
        "agent",
        json!({"prompt": "Count to ten", "count": 0}),
        move |state: Value, _n: u32| async move {
            let count = state["count"].as_u64().unwrap_or(0);
            let mut next = state.clone();
            next["count"] = json!((count + per_step).min(10));
            Ok::<_, anyhow::Error>(next)
        },
        |state: &Value| state["count"].as_u64().unwrap_or(0) as f64 / 10.0,
    )
}

/// A session run against the file store can be read back after reopening
#[tokio::test]
async fn test_session_persisted_to_file_store() {
    let temp_dir = TempDir::new().unwrap();
    let config = LearningConfig::default();
    let store = Arc::new(FileLearningStore::new(temp_dir.path()).await.unwrap());
    let manager = Arc::new(BudgetIterationManager::new(config.budget.clone()));
    let coordinator = MultiTurnLearningCoordinator::new(config, store, manager);

    let result = coordinator
        .start_session(counting_task("count", 2), SessionOptions::default())
        .await;
    assert!(result.success);
    assert_eq!(result.iterations_completed, 4);

    let reopened = FileLearningStore::new(temp_dir.path()).await.unwrap();
    let session = reopened.get_session(&result.session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.improvement_trajectory, vec![0.2, 0.4, 0.6, 0.8]);
    assert_eq!(session.final_result, result.final_state);
    assert!(session.summary.is_some());

    let iterations = reopened.list_iterations(&result.session_id).await.unwrap();
    let numbers: Vec<u32> = iterations.iter().map(|i| i.iteration_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(iterations.iter().all(|i| !i.snapshot_id.is_empty()));
}

/// Concurrent sessions on one coordinator stay independent
#[tokio::test]
async fn test_concurrent_sessions() {
    let config = LearningConfig::default();
    let store = Arc::new(InMemoryLearningStore::new());
    let manager = Arc::new(BudgetIterationManager::new(config.budget.clone()));
    let coordinator = Arc::new(MultiTurnLearningCoordinator::new(config, store, manager));

    let handles: Vec<_> = [1u64, 2, 5]
        .into_iter()
        .map(|step| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .start_session(
                        counting_task(&format!("task-{}", step), step),
                        SessionOptions::default(),
                    )
                    .await
            })
        })
        .collect();

    let mut iterations = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.threshold_met);
        iterations.push(result.iterations_completed);
    }
    assert_eq!(iterations, vec![8, 4, 2]);
    assert!(coordinator.active_sessions().await.is_empty());
    assert_eq!(coordinator.preservation().cache_stats().await.total_snapshots, 0);
}

/// Learned patterns survive a restart and are recognized as known
#[tokio::test]
async fn test_patterns_reload_from_store() {
    let temp_dir = TempDir::new().unwrap();
    let config = LearningConfig::default();
    let context = IterationContext::default();

    let first = {
        let store: Arc<dyn LearningStore> =
            Arc::new(FileLearningStore::new(temp_dir.path()).await.unwrap());
        let recognizer = ErrorPatternRecognizer::new(config.patterns.clone(), store);
        assert_eq!(recognizer.initialize().await, 0);
        recognizer
            .analyze_error(&context, "Connection timed out after 3000ms", None)
            .await
    };
    assert_eq!(first.category, ErrorCategory::TimeoutError);
    assert!(!first.is_known_pattern);

    let store: Arc<dyn LearningStore> =
        Arc::new(FileLearningStore::new(temp_dir.path()).await.unwrap());
    let recognizer = ErrorPatternRecognizer::new(config.patterns.clone(), store);
    assert_eq!(recognizer.initialize().await, 1);
    let second = recognizer
        .analyze_error(&context, "Connection timed out after 5000ms", None)
        .await;
    assert!(second.is_known_pattern);
    assert_eq!(second.pattern_id, first.pattern_id);
    assert!(second.confidence > first.confidence);
}

/// Diff chains restore to the exact state of every checkpoint
#[tokio::test]
async fn test_checkpoint_chain_restores_each_state() {
    let engine = ContextPreservationEngine::new(LearningConfig::default().preservation);
    let states = vec![
        json!({"prompt": "p", "notes": [], "score": 0}),
        json!({"prompt": "p", "notes": ["a"], "score": 1}),
        json!({"prompt": "p2", "notes": ["a"], "score": 1, "extra": {"k": true}}),
        json!({"prompt": "p2", "score": 2}),
    ];

    let mut ids = Vec::new();
    let mut base: Option<String> = None;
    for (n, state) in states.iter().enumerate() {
        let receipt = engine
            .create_snapshot("s1", n as u32, state, base.as_deref())
            .await
            .unwrap();
        assert_eq!(receipt.is_diff, n > 0);
        base = Some(receipt.snapshot_id.clone());
        ids.push(receipt.snapshot_id);
    }

    for (id, expected) in ids.iter().zip(&states) {
        let outcome = engine.restore_snapshot(id).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.checksum_valid, Some(true));
        assert_eq!(outcome.state.as_ref(), Some(expected));
    }

    assert_eq!(engine.clear_session("s1").await, 4);
    assert!(engine.restore_snapshot(&ids[0]).await.is_err());
}

/// A config file on disk drives session defaults
#[tokio::test]
async fn test_config_file_overrides_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [session]
        quality_threshold = 0.5

        [budget]
        max_iterations = 2
        "#,
    )
    .unwrap();

    let config = LearningConfig::load_or_default(Some(&path)).unwrap();
    assert_eq!(config.session.quality_threshold, 0.5);
    assert_eq!(config.budget.max_iterations, 2);

    let store = Arc::new(InMemoryLearningStore::new());
    let manager = Arc::new(BudgetIterationManager::new(config.budget.clone()));
    let coordinator = MultiTurnLearningCoordinator::new(config, store, manager);
    let result = coordinator
        .start_session(counting_task("slow", 1), SessionOptions::default())
        .await;

    assert!(result.success);
    assert!(!result.threshold_met);
    assert_eq!(result.iterations_completed, 2);
    assert_eq!(
        result.termination_reason.as_deref(),
        Some("Maximum iterations (2) reached")
    );
}
