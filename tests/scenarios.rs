//! End-to-end commits against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use serde_json::json;
use std::sync::Arc;

use async_trait::async_trait;
use common::{
    break_on, classes, fixture, heal, models, response_map, topology_inputs, Fixture,
    TopologyModule, BUCKET, SUBNET, VPC,
};
use keystone::action::{Action, ActionInputs, ActionOutputs, ActionScope};
use keystone::engine::Engine;
use keystone::error::{KeystoneError, Result, SelectionError, TransactionError};
use keystone::graph::NodeKind;
use keystone::module::ModuleContainer;
use keystone::planner::{Diff, DiffAction};
use keystone::serialization::{Document, GraphSerializer, RESOURCES_DOCUMENT};
use keystone::state::{MemoryStateStore, StateStore};
use keystone::transaction::{Journal, Phase, TransactionState};

fn engine() -> (Engine<MemoryStateStore>, Fixture) {
    let mut fixture = fixture();
    let actions = std::mem::take(&mut fixture.actions);
    let engine = Engine::new(MemoryStateStore::new(), classes()).with_actions(actions);
    (engine, fixture)
}

async fn resources_document(store: &MemoryStateStore) -> Document {
    let bytes = store.get_state(RESOURCES_DOCUMENT).await.unwrap();
    Document::from_bytes(RESOURCES_DOCUMENT, &bytes).unwrap()
}

#[tokio::test]
async fn test_models_apply_parent_before_child() {
    let (engine, fixture) = engine();
    let current = models(engine.classes(), &[("t", "r1", Some("qa"))]);

    let mut transaction = engine.begin(current).await.unwrap();
    let levels: Vec<Vec<String>> = transaction
        .model_plan()
        .levels()
        .iter()
        .map(|level| {
            level
                .iter()
                .map(|p| p.metadata.diff.context().to_string())
                .collect()
        })
        .collect();
    assert_eq!(
        levels,
        vec![
            vec!["app=t".to_string()],
            vec!["region=r1,app=t".to_string()],
            vec!["environment=qa,region=r1,app=t".to_string()],
        ]
    );

    while transaction.state() != TransactionState::Committed {
        transaction.advance().await.unwrap();
    }
    assert_eq!(
        fixture.log.contexts("topology"),
        vec![
            "app=t".to_string(),
            "region=r1,app=t".to_string(),
            "environment=qa,region=r1,app=t".to_string(),
        ]
    );

    // The VPC is provisioned before the subnet that depends on it.
    let provisioned = fixture.log.contexts("provision");
    let vpc = provisioned.iter().position(|c| c == &format!("{VPC}=vpc-t"));
    let subnet = provisioned
        .iter()
        .position(|c| c == &format!("{SUBNET}=subnet-r1"));
    assert!(vpc.unwrap() < subnet.unwrap());

    let resources = engine.load_resources().await.unwrap();
    assert_eq!(
        response_map(&resources, &format!("{VPC}=vpc-t")).get("arn"),
        Some(&json!("arn:example:vpc-t"))
    );
    assert!(resources.nodes().all(|node| !node.is_dirty()));
}

#[tokio::test]
async fn test_removed_environment_is_a_single_delete() {
    let (engine, fixture) = engine();
    engine
        .apply(models(engine.classes(), &[("t", "r1", Some("qa"))]))
        .await
        .unwrap();
    fixture.log.clear();

    let report = engine
        .plan(models(engine.classes(), &[("t", "r1", None)]))
        .await
        .unwrap();
    assert_eq!(report.model_diffs.len(), 1);
    let delete = &report.model_diffs[0].diff;
    assert_eq!(delete.action(), DiffAction::Delete);
    assert_eq!(delete.field(), "environmentName");
    assert_eq!(delete.value(), &json!("qa"));
    assert_eq!(delete.context(), "environment=qa,region=r1,app=t");
    assert!(report.resource_diffs.is_empty());
}

#[tokio::test]
async fn test_second_commit_is_a_no_op() {
    let (engine, fixture) = engine();
    let current = models(engine.classes(), &[("t", "r1", Some("qa"))]);
    engine.apply(current.clone()).await.unwrap();
    let before = engine.store().get_state(RESOURCES_DOCUMENT).await.unwrap();
    fixture.log.clear();

    let record = engine.apply(current).await.unwrap();
    assert!(record.model_diffs.is_empty());
    assert!(record.applied.is_empty());
    assert!(fixture.log.contexts("provision").is_empty());

    let after = engine.store().get_state(RESOURCES_DOCUMENT).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_committed_resources_round_trip() {
    let (engine, _fixture) = engine();
    engine
        .apply(models(engine.classes(), &[("a", "r1", None), ("b", "r2", None)]))
        .await
        .unwrap();

    let stored = resources_document(engine.store()).await;
    let loaded = engine.load_resources().await.unwrap();
    let reserialized = GraphSerializer::new(Arc::clone(engine.classes())).serialize(&loaded);
    assert_eq!(stored, reserialized);
    assert_eq!(stored.to_bytes().unwrap(), reserialized.to_bytes().unwrap());
}

#[tokio::test]
async fn test_shared_bucket_follows_its_owners() {
    let (engine, fixture) = engine();
    let bucket = format!("{BUCKET}=logs");

    engine
        .apply(models(engine.classes(), &[("a", "r1", None), ("b", "r2", None)]))
        .await
        .unwrap();
    let resources = engine.load_resources().await.unwrap();
    let owners: Vec<&str> = resources
        .find(&bucket)
        .unwrap()
        .owners()
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(owners, vec!["app=a", "app=b"]);
    assert_eq!(fixture.log.count("provision", &bucket), 1);

    // Dropping one owner only updates the owner set.
    let record = engine
        .apply(models(engine.classes(), &[("b", "r2", None)]))
        .await
        .unwrap();
    let owners_update = record
        .applied
        .iter()
        .find(|m| m.diff.context() == bucket)
        .unwrap();
    assert_eq!(owners_update.diff.action(), DiffAction::Update);
    assert_eq!(owners_update.diff.field(), "owners");
    assert_eq!(owners_update.diff.value(), &json!(["app=b"]));
    assert_eq!(
        owners_update.outputs.get(&format!("{bucket}.owners")),
        Some(&json!(["app=b"]))
    );
    assert_eq!(fixture.log.count("provision", &bucket), 1);
    assert!(engine.load_resources().await.unwrap().contains(&bucket));

    // The last owner deletes the bucket.
    let record = engine
        .apply(models(engine.classes(), &[]))
        .await
        .unwrap();
    assert!(record
        .applied
        .iter()
        .any(|m| m.diff.context() == bucket && m.diff.action() == DiffAction::Delete));
    assert_eq!(fixture.log.count("provision", &bucket), 2);
    assert!(engine.load_resources().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_level_resumes_without_repeating_actions() {
    let (engine, fixture) = engine();
    let vpc_a = format!("{VPC}=vpc-a");
    let vpc_b = format!("{VPC}=vpc-b");
    break_on(&fixture.fail_on, &vpc_b);

    let current = models(engine.classes(), &[("a", "r1", None), ("b", "r2", None)]);
    let mut transaction = engine.begin(current.clone()).await.unwrap();
    let err = loop {
        match transaction.advance().await {
            Ok(_) => {}
            Err(e) => break e,
        }
    };
    assert!(matches!(
        err,
        KeystoneError::Transaction(TransactionError::ActionFailed { ref context, .. })
            if context == &vpc_b
    ));

    assert_eq!(transaction.state(), TransactionState::Failed);
    let failure = transaction.failure().unwrap();
    assert_eq!(failure.phase, Some(Phase::Resource));
    assert_eq!(failure.level, 0);
    assert!(engine.store().lock_info().await.unwrap().is_none());

    // Applied diffs stay dirty, unapplied ones are not persisted.
    let document = resources_document(engine.store()).await;
    assert!(document.dirty_contexts().contains(&vpc_a));
    assert!(document.get(&vpc_b).is_none());

    // A fresh transaction refuses to run on top of dirty resources.
    let blocked = engine.begin(current).await.unwrap_err();
    assert!(matches!(
        blocked,
        KeystoneError::Transaction(TransactionError::DirtyResources { ref contexts })
            if contexts.contains(&vpc_a)
    ));

    heal(&fixture.fail_on);
    transaction.resume().await.unwrap();
    while transaction.state() != TransactionState::Committed {
        transaction.advance().await.unwrap();
    }

    assert_eq!(fixture.log.count("provision", &vpc_a), 1);
    assert_eq!(fixture.log.count("provision", &vpc_b), 2);
    let document = resources_document(engine.store()).await;
    assert!(document.dirty_contexts().is_empty());
    assert!(document.get(&vpc_b).is_some());

    let journal = Journal::load(engine.store()).await.unwrap();
    assert_eq!(journal.latest().unwrap().status, TransactionState::Committed);
}

#[tokio::test]
async fn test_rollback_reverts_the_failed_level() {
    let (engine, fixture) = engine();
    let vpc_a = format!("{VPC}=vpc-a");
    let vpc_b = format!("{VPC}=vpc-b");
    break_on(&fixture.fail_on, &vpc_b);

    let current = models(engine.classes(), &[("a", "r1", None), ("b", "r2", None)]);
    let mut transaction = engine.begin(current.clone()).await.unwrap();
    while transaction.advance().await.is_ok() {}
    assert_eq!(transaction.state(), TransactionState::Failed);

    transaction.rollback().await.unwrap();
    assert_eq!(transaction.state(), TransactionState::Aborted);
    assert_eq!(fixture.log.count("revert", &vpc_a), 1);
    assert_eq!(fixture.log.count("revert", &vpc_b), 0);

    let document = resources_document(engine.store()).await;
    assert!(document.dirty_contexts().is_empty());
    assert!(document.get(&vpc_a).is_none());

    let journal = Journal::load(engine.store()).await.unwrap();
    assert_eq!(journal.latest().unwrap().status, TransactionState::Aborted);

    heal(&fixture.fail_on);
    let record = engine.apply(current).await.unwrap();
    assert_eq!(record.status, TransactionState::Committed);
}

#[tokio::test]
async fn test_cleared_markers_allow_a_fresh_apply() {
    let (engine, fixture) = engine();
    let vpc_a = format!("{VPC}=vpc-a");
    let vpc_b = format!("{VPC}=vpc-b");
    break_on(&fixture.fail_on, &vpc_b);

    let current = models(engine.classes(), &[("a", "r1", None), ("b", "r2", None)]);
    assert!(engine.apply(current.clone()).await.is_err());

    // The applied VPC keeps the response its action returned.
    let mut document = resources_document(engine.store()).await;
    let entry = document.get(&vpc_a).unwrap();
    assert!(entry.payload.dirty);
    assert!(entry.payload.response.contains_key("arn"));

    // An operator confirms the VPC exists and clears the markers.
    assert!(document.clear_dirty().contains(&vpc_a));
    engine
        .store()
        .save_state(RESOURCES_DOCUMENT, &document.to_bytes().unwrap())
        .await
        .unwrap();

    heal(&fixture.fail_on);
    let record = engine.apply(current).await.unwrap();
    assert_eq!(record.status, TransactionState::Committed);
    assert_eq!(fixture.log.count("provision", &vpc_a), 1);
    assert_eq!(fixture.log.count("provision", &vpc_b), 2);

    let resources = engine.load_resources().await.unwrap();
    assert!(response_map(&resources, &vpc_a).contains_key("arn"));
    assert!(resources_document(engine.store()).await.dirty_contexts().is_empty());
}

#[tokio::test]
async fn test_busy_lock_is_retryable() {
    let (engine, _fixture) = engine();
    let held = engine.store().lock_app().await.unwrap();

    let err = engine
        .begin(models(engine.classes(), &[("t", "r1", None)]))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    engine.store().unlock_app(&held.lock_id).await.unwrap();
    assert!(engine
        .begin(models(engine.classes(), &[("t", "r1", None)]))
        .await
        .is_ok());
}

/// Requires the CIDR published by the `network` module.
struct CidrAction;

#[async_trait]
impl Action for CidrAction {
    fn name(&self) -> &str {
        "cidr"
    }

    fn filter(&self, diff: &Diff) -> bool {
        diff.node_type() == "app" && diff.action() == DiffAction::Add
    }

    fn collect_input(&self, _diff: &Diff) -> Vec<String> {
        vec![String::from("metadata.network.cidr")]
    }

    async fn handle(
        &self,
        diff: &Diff,
        inputs: &ActionInputs,
        _scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutputs> {
        let mut outputs = ActionOutputs::new();
        if let Some(cidr) = inputs.get("metadata.network.cidr") {
            outputs.insert(format!("{}.cidr", diff.context()), cidr.clone());
        }
        Ok(outputs)
    }
}

#[tokio::test]
async fn test_unresolved_input_fails_the_model_phase() {
    let (mut engine, _fixture) = engine();
    engine
        .actions_mut()
        .register(NodeKind::Model, Arc::new(CidrAction))
        .unwrap();

    let mut transaction = engine
        .begin(models(engine.classes(), &[("t", "r1", None)]))
        .await
        .unwrap();
    let err = transaction.advance().await.unwrap_err();
    assert!(matches!(
        err,
        KeystoneError::Selection(SelectionError::UnresolvedInput { ref input, .. })
            if input == "metadata.network.cidr"
    ));
    assert_eq!(transaction.state(), TransactionState::Failed);
    assert_eq!(transaction.failure().unwrap().phase, Some(Phase::Model));

    // Model actions only touched the in-memory graph, so there is nothing
    // to resume.
    assert!(matches!(
        transaction.resume().await.unwrap_err(),
        KeystoneError::Transaction(TransactionError::InvalidState { .. })
    ));
    assert!(engine.store().lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_module_metadata_feeds_action_inputs() {
    let (mut engine, _fixture) = engine();
    engine
        .actions_mut()
        .register(NodeKind::Model, Arc::new(CidrAction))
        .unwrap();

    let mut modules = ModuleContainer::new();
    modules
        .register(
            Arc::new(TopologyModule {
                id: String::from("network"),
            }),
            topology_inputs("t", "r1").with("cidr", "10.0.0.0/16"),
        )
        .unwrap();
    let mut engine = engine.with_modules(modules);

    let current = engine.build_models().unwrap();
    assert!(current.contains("region=r1,app=t"));
    assert_eq!(engine.modules().roots("network").len(), 1);
    let node_count = current.len();

    let record = engine.apply(current).await.unwrap();
    assert_eq!(record.status, TransactionState::Committed);
    let app_add = record
        .model_diffs
        .iter()
        .find(|m| m.diff.context() == "app=t")
        .unwrap();
    assert_eq!(app_add.actions, vec!["topology", "cidr"]);
    assert_eq!(
        app_add.inputs.get("metadata.network.cidr"),
        Some(&json!("10.0.0.0/16"))
    );
    assert_eq!(app_add.outputs.get("app=t.cidr"), Some(&json!("10.0.0.0/16")));

    let committed = engine.load_models().await.unwrap();
    assert_eq!(committed.len(), node_count);
}
