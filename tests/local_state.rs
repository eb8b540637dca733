//! Commits persisted through the filesystem backend.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use tempfile::TempDir;

use common::{break_on, classes, fixture, models, response_map, Fixture, VPC};
use keystone::engine::Engine;
use keystone::error::{KeystoneError, TransactionError};
use keystone::serialization::{
    Document, GraphSerializer, CHECKPOINT_DOCUMENT, MODELS_DOCUMENT, RESOURCES_DOCUMENT,
};
use keystone::state::{LocalStateStore, StateStore};
use keystone::transaction::TransactionState;

fn local_engine(dir: &TempDir) -> (Engine<LocalStateStore>, Fixture) {
    let mut fixture = fixture();
    let actions = std::mem::take(&mut fixture.actions);
    let engine =
        Engine::new(LocalStateStore::with_base_dir(dir.path()), classes()).with_actions(actions);
    (engine, fixture)
}

#[tokio::test]
async fn test_snapshots_survive_a_new_engine() {
    let dir = TempDir::new().unwrap();

    let (first, _) = local_engine(&dir);
    let current = models(first.classes(), &[("a", "r1", Some("qa")), ("b", "r2", None)]);
    let record = first.apply(current.clone()).await.unwrap();
    assert_eq!(record.status, TransactionState::Committed);

    assert!(dir.path().join(MODELS_DOCUMENT).exists());
    assert!(dir.path().join(RESOURCES_DOCUMENT).exists());
    let resources_bytes = first.store().get_state(RESOURCES_DOCUMENT).await.unwrap();

    let (second, _) = local_engine(&dir);
    let serializer = GraphSerializer::new(Arc::clone(second.classes()));

    let loaded_models = second.load_models().await.unwrap();
    assert_eq!(
        serializer.serialize(&loaded_models),
        serializer.serialize(&current)
    );

    let loaded_resources = second.load_resources().await.unwrap();
    assert!(loaded_resources.contains(&format!("{VPC}=vpc-a")));
    assert_eq!(
        serializer.serialize(&loaded_resources).to_bytes().unwrap(),
        resources_bytes
    );

    // Nothing changed, so the second engine has nothing to do.
    let report = second.plan(current).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(second.journal().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lock_file_is_released_after_commit() {
    let dir = TempDir::new().unwrap();
    let (engine, _) = local_engine(&dir);

    engine
        .apply(models(engine.classes(), &[("t", "r1", None)]))
        .await
        .unwrap();
    assert!(engine.store().lock_info().await.unwrap().is_none());

    let held = engine.store().lock_app().await.unwrap();
    let err = engine
        .apply(models(engine.classes(), &[]))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    engine.store().unlock_app(&held.lock_id).await.unwrap();
}

#[tokio::test]
async fn test_failed_transaction_resumes_in_a_new_engine() {
    let dir = TempDir::new().unwrap();
    let vpc_a = format!("{VPC}=vpc-a");
    let vpc_b = format!("{VPC}=vpc-b");

    let (first, first_fixture) = local_engine(&dir);
    break_on(&first_fixture.fail_on, &vpc_b);
    let current = models(first.classes(), &[("a", "r1", None), ("b", "r2", None)]);
    let mut transaction = first.begin(current).await.unwrap();
    while transaction.advance().await.is_ok() {}
    assert_eq!(transaction.state(), TransactionState::Failed);
    let failed_id = transaction.id().to_string();
    drop(transaction);

    // The applied VPC is persisted dirty, with the response its action set.
    assert!(dir.path().join(CHECKPOINT_DOCUMENT).exists());
    let bytes = first.store().get_state(RESOURCES_DOCUMENT).await.unwrap();
    let document = Document::from_bytes(RESOURCES_DOCUMENT, &bytes).unwrap();
    let entry = document.get(&vpc_a).unwrap();
    assert!(entry.payload.dirty);
    assert!(entry.payload.response.contains_key("arn"));

    let (second, second_fixture) = local_engine(&dir);
    let mut recovered = second.recover().await.unwrap();
    assert_eq!(recovered.id(), failed_id);
    assert_eq!(recovered.state(), TransactionState::Failed);
    assert!(recovered.lock().is_none());

    recovered.resume().await.unwrap();
    while recovered.state() != TransactionState::Committed {
        recovered.advance().await.unwrap();
    }

    assert_eq!(first_fixture.log.count("provision", &vpc_a), 1);
    assert_eq!(second_fixture.log.count("provision", &vpc_a), 0);
    assert_eq!(second_fixture.log.count("provision", &vpc_b), 1);

    let resources = second.load_resources().await.unwrap();
    assert!(response_map(&resources, &vpc_a).contains_key("arn"));
    assert!(response_map(&resources, &vpc_b).contains_key("arn"));
    assert!(second.load_models().await.unwrap().contains("app=a"));
    assert!(second.store().lock_info().await.unwrap().is_none());

    let journal = second.journal().await.unwrap();
    assert_eq!(journal.len(), 1);
    let record = journal.get(&failed_id).unwrap();
    assert_eq!(record.status, TransactionState::Committed);
    assert!(record.applied.iter().any(|m| m.diff.context() == vpc_a));

    // Once committed the checkpoint is stale.
    assert!(second.recover().await.is_err());
}

#[tokio::test]
async fn test_recover_refuses_edited_resources() {
    let dir = TempDir::new().unwrap();
    let vpc_b = format!("{VPC}=vpc-b");

    let (first, first_fixture) = local_engine(&dir);
    break_on(&first_fixture.fail_on, &vpc_b);
    let current = models(first.classes(), &[("a", "r1", None), ("b", "r2", None)]);
    assert!(first.apply(current).await.is_err());

    let bytes = first.store().get_state(RESOURCES_DOCUMENT).await.unwrap();
    let mut document = Document::from_bytes(RESOURCES_DOCUMENT, &bytes).unwrap();
    assert!(!document.clear_dirty().is_empty());
    first
        .store()
        .save_state(RESOURCES_DOCUMENT, &document.to_bytes().unwrap())
        .await
        .unwrap();

    let (second, _) = local_engine(&dir);
    let err = second.recover().await.unwrap_err();
    assert!(matches!(
        err,
        KeystoneError::Transaction(TransactionError::SnapshotChanged { .. })
    ));
}
