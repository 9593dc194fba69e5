//! Run Cache Integration Tests
//!
//! create_or_get idempotence, seed handling, registry capacity and
//! single-flight builds.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, open_vault, open_with, FakePipeline};
use runvault::core::audit::ACTIVE_LOG;
use runvault::{RetentionState, VaultError, VaultOptions};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_identical_config_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let pipeline = Arc::new(FakePipeline::default());
    let vault = open_vault(&temp, pipeline.clone()).await;

    let cfg = config("sma_cross", "SPY").with_feature("close").with_feature("volume");
    let first = vault.create_or_get(&cfg, None).await.unwrap();

    let equity = vault.store().run_dir(&first.run_hash).join("equity.parquet");
    let written_at = std::fs::metadata(&equity).unwrap().modified().unwrap();
    let audit_len = std::fs::metadata(temp.path().join(ACTIVE_LOG)).unwrap().len();

    let second = vault.create_or_get(&cfg, None).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.run_hash, second.run_hash);
    assert_eq!(pipeline.executions(), 1);

    // No artifact rewrite, no audit entry
    assert_eq!(std::fs::metadata(&equity).unwrap().modified().unwrap(), written_at);
    assert_eq!(std::fs::metadata(temp.path().join(ACTIVE_LOG)).unwrap().len(), audit_len);
}

#[tokio::test]
async fn test_ordering_does_not_change_hash() {
    let temp = TempDir::new().unwrap();
    let pipeline = Arc::new(FakePipeline::default());
    let vault = open_vault(&temp, pipeline.clone()).await;

    let a = config("sma_cross", "SPY")
        .with_feature("close")
        .with_feature("volume")
        .with_param("fast", json!(10))
        .with_param("slow", json!(50));
    let b = config("sma_cross", "SPY")
        .with_param("slow", json!(50))
        .with_feature("volume")
        .with_param("fast", json!(10))
        .with_feature("close");

    let first = vault.create_or_get(&a, None).await.unwrap();
    let second = vault.create_or_get(&b, None).await.unwrap();
    assert_eq!(first.run_hash, second.run_hash);
    assert!(!second.created);
    assert_eq!(pipeline.executions(), 1);
}

#[tokio::test]
async fn test_semantic_fields_change_hash() {
    let temp = TempDir::new().unwrap();
    let vault = open_vault(&temp, Arc::new(FakePipeline::default())).await;

    let base = vault.create_or_get(&config("sma", "SPY"), None).await.unwrap();
    let reseeded = vault
        .create_or_get(&config("sma", "SPY").with_seed(1), None)
        .await
        .unwrap();
    let other_param = vault
        .create_or_get(&config("sma", "SPY").with_param("fast", json!(5)), None)
        .await
        .unwrap();

    assert!(reseeded.created);
    assert!(other_param.created);
    assert_ne!(base.run_hash, reseeded.run_hash);
    assert_ne!(base.run_hash, other_param.run_hash);
}

#[tokio::test]
async fn test_seed_argument_does_not_bypass_cache() {
    let temp = TempDir::new().unwrap();
    let pipeline = Arc::new(FakePipeline::default());
    let vault = open_vault(&temp, pipeline.clone()).await;

    let cfg = config("sma", "SPY");
    let first = vault.create_or_get(&cfg, Some(11)).await.unwrap();
    let second = vault.create_or_get(&cfg, Some(22)).await.unwrap();

    assert_eq!(first.run_hash, second.run_hash);
    assert!(!second.created);
    assert_eq!(pipeline.executions(), 1);
    // The cached record is the one built with the first seed
    assert_eq!(second.record.summary, first.record.summary);
}

#[tokio::test]
async fn test_capacity_holds_after_every_insert() {
    let temp = TempDir::new().unwrap();
    let vault = open_with(
        VaultOptions::new(temp.path()).with_capacity(100),
        Arc::new(FakePipeline::default()),
    )
    .await;

    let mut hashes = Vec::new();
    for i in 0..105 {
        let outcome = vault
            .create_or_get(&config("sma", &format!("SYM{}", i)), None)
            .await
            .unwrap();
        hashes.push(outcome.run_hash);
        assert!(vault.registry().len().await <= 100);
    }

    assert_eq!(vault.registry().len().await, 100);
    for evicted in &hashes[..5] {
        assert!(matches!(
            vault.get_run(evicted).await,
            Err(VaultError::NotFound { .. })
        ));
    }
    assert!(vault.get_run(&hashes[104]).await.is_ok());
}

#[tokio::test]
async fn test_pinned_run_still_evicted_from_registry() {
    let temp = TempDir::new().unwrap();
    let vault = open_with(
        VaultOptions::new(temp.path()).with_capacity(2),
        Arc::new(FakePipeline::default()),
    )
    .await;

    let first = vault.create_or_get(&config("sma", "A"), None).await.unwrap();
    vault.pin(&first.run_hash).await.unwrap();
    vault.create_or_get(&config("sma", "B"), None).await.unwrap();
    vault.create_or_get(&config("sma", "C"), None).await.unwrap();

    assert_eq!(vault.registry().len().await, 2);
    assert!(vault.get_run(&first.run_hash).await.is_err());
    // Cache eviction does not touch the disk tier
    assert!(vault
        .store()
        .run_dir(&first.run_hash)
        .join("equity.parquet")
        .exists());
}

#[tokio::test]
async fn test_concurrent_identical_requests_single_flight() {
    let temp = TempDir::new().unwrap();
    let pipeline = Arc::new(FakePipeline::with_delay(Duration::from_millis(100)));
    let vault = Arc::new(open_vault(&temp, pipeline.clone()).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let vault = vault.clone();
        handles.push(tokio::spawn(async move {
            vault
                .create_or_get(&config("sma", "SPY"), None)
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut hashes = std::collections::HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.created {
            created += 1;
        }
        hashes.insert(outcome.run_hash);
    }

    assert_eq!(pipeline.executions(), 1);
    assert_eq!(created, 1);
    assert_eq!(hashes.len(), 1);
}

#[tokio::test]
async fn test_new_run_layout() {
    let temp = TempDir::new().unwrap();
    let vault = open_vault(&temp, Arc::new(FakePipeline::default())).await;

    let run = vault.create_or_get(&config("sma", "SPY"), None).await.unwrap();
    assert_eq!(run.record.retention_state, RetentionState::Full);
    assert!(!run.record.pinned);

    let artifacts = vault.list_artifacts(&run.run_hash).await.unwrap();
    assert_eq!(
        artifacts,
        vec!["equity.parquet", "metrics.json", "plots.png", "summary.json", "validation.json"]
    );

    let dir = vault.store().run_dir(&run.run_hash);
    assert!(dir.join("manifest.json").exists());
    assert!(dir.join("record.json").exists());

    let verification = vault.verify_run(&run.run_hash).await.unwrap();
    assert_eq!(verification.verified_files, 5);
    assert_eq!(verification.manifest_hash, run.record.manifest.manifest_hash);
}

#[tokio::test]
async fn test_tampered_manifest_detected() {
    let temp = TempDir::new().unwrap();
    let vault = open_vault(&temp, Arc::new(FakePipeline::default())).await;
    let run = vault.create_or_get(&config("sma", "SPY"), None).await.unwrap();

    let path = vault.store().run_dir(&run.run_hash).join("manifest.json");
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("\"plots.png\"", "\"plots2.png\"")).unwrap();

    let err = vault.verify_run(&run.run_hash).await.unwrap_err();
    assert!(err.is_integrity(), "{:?}", err);
}

#[tokio::test]
async fn test_tampered_artifact_detected() {
    let temp = TempDir::new().unwrap();
    let vault = open_vault(&temp, Arc::new(FakePipeline::default())).await;
    let run = vault.create_or_get(&config("sma", "SPY"), None).await.unwrap();

    let path = vault.store().run_dir(&run.run_hash).join("plots.png");
    std::fs::write(&path, b"something else").unwrap();

    assert!(vault.verify_run(&run.run_hash).await.unwrap_err().is_integrity());
}

#[tokio::test]
async fn test_corrupt_run_skipped_on_reopen() {
    let temp = TempDir::new().unwrap();
    let (good, bad) = {
        let vault = open_vault(&temp, Arc::new(FakePipeline::default())).await;
        let good = vault.create_or_get(&config("sma", "A"), None).await.unwrap();
        let bad = vault.create_or_get(&config("sma", "B"), None).await.unwrap();
        (good.run_hash, bad.run_hash)
    };

    let manifest = temp.path().join("artifacts").join(&bad).join("manifest.json");
    let content = std::fs::read_to_string(&manifest).unwrap();
    std::fs::write(&manifest, content.replace("equity.parquet", "equity.parquez")).unwrap();

    let vault = open_vault(&temp, Arc::new(FakePipeline::default())).await;
    assert!(vault.get_run(&good).await.is_ok());
    assert!(vault.get_run(&bad).await.is_err());
}

#[tokio::test]
async fn test_resubmit_after_registry_eviction_keeps_tier_state() {
    let temp = TempDir::new().unwrap();
    let pipeline = Arc::new(FakePipeline::default());
    let vault = open_with(
        VaultOptions::new(temp.path()).with_capacity(1),
        pipeline.clone(),
    )
    .await;

    let first = vault.create_or_get(&config("sma", "A"), None).await.unwrap();
    let pinned = vault.pin(&first.run_hash).await.unwrap();
    vault.create_or_get(&config("sma", "B"), None).await.unwrap();
    assert!(vault.get_run(&first.run_hash).await.is_err());

    let again = vault.create_or_get(&config("sma", "A"), None).await.unwrap();
    assert!(!again.created);
    assert_eq!(pipeline.executions(), 2);
    assert!(again.record.pinned);
    assert_eq!(again.record.retention_state, RetentionState::Pinned);
    assert_eq!(again.record.created_at, pinned.created_at);
    assert_eq!(vault.get_run(&first.run_hash).await.unwrap(), again.record);
}

#[tokio::test]
async fn test_rebuild_of_damaged_run_keeps_pin() {
    let temp = TempDir::new().unwrap();
    let pipeline = Arc::new(FakePipeline::default());
    let vault = open_with(
        VaultOptions::new(temp.path()).with_capacity(1),
        pipeline.clone(),
    )
    .await;

    let first = vault.create_or_get(&config("sma", "A"), None).await.unwrap();
    vault.pin(&first.run_hash).await.unwrap();
    vault.create_or_get(&config("sma", "B"), None).await.unwrap();

    let manifest = vault.store().run_dir(&first.run_hash).join("manifest.json");
    std::fs::write(&manifest, b"{\"truncated\":").unwrap();

    let rebuilt = vault.create_or_get(&config("sma", "A"), None).await.unwrap();
    assert!(rebuilt.created);
    assert_eq!(pipeline.executions(), 3);
    assert!(rebuilt.record.pinned);
    assert_eq!(rebuilt.record.retention_state, RetentionState::Pinned);
    assert!(vault.verify_run(&first.run_hash).await.is_ok());
}
