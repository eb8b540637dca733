//! Engine facade tying classes, actions, modules and the state store.
//!
//! The engine owns everything a transaction borrows. It offers a dry-run
//! [`Engine::plan`] and a one-shot [`Engine::apply`]; callers that need to
//! stop between phases or resume after a failure drive the
//! [`Transaction`] returned by [`Engine::begin`] themselves. A transaction
//! that failed in another process comes back through [`Engine::recover`].

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::action::ActionRegistry;
use crate::config::TransactionConfig;
use crate::error::{KeystoneError, Result, SerializationError, StateError, TransactionError};
use crate::graph::Graph;
use crate::module::ModuleContainer;
use crate::planner::{DiffMetadata, PlanSummary};
use crate::serialization::{
    ClassRegistry, GraphSerializer, CHECKPOINT_DOCUMENT, MODELS_DOCUMENT, RESOURCES_DOCUMENT,
};
use crate::state::StateStore;
use crate::transaction::{
    load_document, Checkpoint, Journal, Transaction, TransactionContext, TransactionRecord,
    TransactionState, JOURNAL_LIMIT,
};

/// Engine facade.
pub struct Engine<S: StateStore> {
    /// State store.
    store: S,
    /// Registered node classes.
    classes: Arc<ClassRegistry>,
    /// Registered actions.
    actions: ActionRegistry,
    /// Registered modules.
    modules: ModuleContainer,
    /// Journal records kept.
    journal_limit: usize,
    /// Retries when the app lock is busy.
    lock_retries: u32,
}

/// Outcome of a dry run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReport {
    /// Model diffs with their selected actions.
    pub model_diffs: Vec<DiffMetadata>,
    /// Resource diffs the model actions would cause.
    pub resource_diffs: Vec<DiffMetadata>,
    /// Counts of model changes.
    pub model_summary: PlanSummary,
    /// Counts of resource changes.
    pub resource_summary: PlanSummary,
}

impl PlanReport {
    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.model_diffs.is_empty() && self.resource_diffs.is_empty()
    }
}

impl std::fmt::Display for PlanReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes required");
        }
        writeln!(f, "Models: {}", self.model_summary)?;
        for metadata in &self.model_diffs {
            writeln!(f, "  {metadata}")?;
        }
        writeln!(f, "Resources: {}", self.resource_summary)?;
        for metadata in &self.resource_diffs {
            writeln!(f, "  {metadata}")?;
        }
        Ok(())
    }
}

impl<S: StateStore> Engine<S> {
    /// Creates an engine with the built-in actions and no modules.
    #[must_use]
    pub fn new(store: S, classes: ClassRegistry) -> Self {
        Self {
            store,
            classes: Arc::new(classes),
            actions: ActionRegistry::new(),
            modules: ModuleContainer::new(),
            journal_limit: JOURNAL_LIMIT,
            lock_retries: 0,
        }
    }

    /// Replaces the action registry.
    #[must_use]
    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    /// Replaces the module container.
    #[must_use]
    pub fn with_modules(mut self, modules: ModuleContainer) -> Self {
        self.modules = modules;
        self
    }

    /// Applies transaction settings.
    #[must_use]
    pub const fn with_config(mut self, config: &TransactionConfig) -> Self {
        self.journal_limit = config.journal_limit;
        self.lock_retries = config.lock_retries;
        self
    }

    /// State store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Registered node classes.
    #[must_use]
    pub const fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    /// Registered actions.
    #[must_use]
    pub const fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Mutable access to the actions, for registration.
    pub fn actions_mut(&mut self) -> &mut ActionRegistry {
        &mut self.actions
    }

    /// Registered modules.
    #[must_use]
    pub const fn modules(&self) -> &ModuleContainer {
        &self.modules
    }

    /// Mutable access to the modules, for registration.
    pub fn modules_mut(&mut self) -> &mut ModuleContainer {
        &mut self.modules
    }

    /// Creates an empty graph over the registered classes.
    #[must_use]
    pub fn new_graph(&self) -> Graph {
        Graph::new(Arc::clone(&self.classes))
    }

    /// Builds the model graph by loading every module.
    ///
    /// # Errors
    ///
    /// Returns the first module error.
    pub fn build_models(&mut self) -> Result<Graph> {
        let mut graph = self.new_graph();
        let created = self.modules.load(&mut graph)?;
        info!("Modules created {} model nodes", created.len());
        Ok(graph)
    }

    /// Loads the committed model graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read or decoded.
    pub async fn load_models(&self) -> Result<Graph> {
        let document = load_document(&self.store, MODELS_DOCUMENT).await?;
        GraphSerializer::new(Arc::clone(&self.classes)).deserialize(MODELS_DOCUMENT, &document)
    }

    /// Loads the committed resource graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read or decoded.
    pub async fn load_resources(&self) -> Result<Graph> {
        let document = load_document(&self.store, RESOURCES_DOCUMENT).await?;
        GraphSerializer::new(Arc::clone(&self.classes)).deserialize(RESOURCES_DOCUMENT, &document)
    }

    /// Loads the transaction journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or decoded.
    pub async fn journal(&self) -> Result<Journal> {
        Journal::load(&self.store).await
    }

    /// Begins a transaction, retrying a busy lock as configured.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn begin(&self, models: Graph) -> Result<Transaction<'_, S>> {
        let mut attempt = 0;
        loop {
            match Transaction::begin(self.context(), models.clone()).await {
                Ok(transaction) => return Ok(transaction),
                Err(e) if e.is_retryable() && attempt < self.lock_retries => {
                    attempt += 1;
                    let delay = e.retry_delay_secs().unwrap_or(1);
                    warn!(
                        "App lock busy, retrying in {delay}s (attempt {attempt}/{})",
                        self.lock_retries
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Restores the last failed transaction saved by any process sharing
    /// this store, so it can be resumed or rolled back.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no failed transaction is waiting, or
    /// `SnapshotChanged` if the resources changed since it failed.
    pub async fn recover(&self) -> Result<Transaction<'_, S>> {
        let checkpoint: Checkpoint = match self.store.get_state(CHECKPOINT_DOCUMENT).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                KeystoneError::Serialization(SerializationError::json(CHECKPOINT_DOCUMENT, e))
            })?,
            Err(KeystoneError::State(StateError::NoState { .. })) => {
                return Err(nothing_to_recover("none"));
            }
            Err(e) => return Err(e),
        };

        let journal = self.journal().await?;
        if let Some(record) = journal.get(&checkpoint.id)
            && record.status != TransactionState::Failed
        {
            return Err(nothing_to_recover(record.status.as_str()));
        }

        info!("Recovering transaction {}", checkpoint.id);
        Transaction::restore(self.context(), Arc::clone(&self.classes), checkpoint).await
    }

    /// Computes model and resource diffs without running resource actions,
    /// then aborts.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot begin or a model action
    /// fails.
    pub async fn plan(&self, models: Graph) -> Result<PlanReport> {
        let mut transaction = self.begin(models).await?;
        transaction.advance().await?;
        transaction.advance().await?;

        let report = PlanReport {
            model_diffs: transaction.model_plan().metadata().cloned().collect(),
            resource_diffs: transaction.resource_plan().metadata().cloned().collect(),
            model_summary: transaction.model_plan().summary(),
            resource_summary: transaction.resource_plan().summary(),
        };
        transaction.abort().await?;
        Ok(report)
    }

    /// Runs a transaction to completion.
    ///
    /// # Errors
    ///
    /// Returns the first error. The failed transaction has already released
    /// the lock and recorded itself in the journal.
    pub async fn apply(&self, models: Graph) -> Result<TransactionRecord> {
        let mut transaction = self.begin(models).await?;
        while transaction.state() != TransactionState::Committed {
            transaction.advance().await?;
        }
        info!("Applied {} diffs", transaction.applied().len());
        Ok(transaction.record())
    }

    fn context(&self) -> TransactionContext<'_, S> {
        TransactionContext::new(&self.store, &self.actions, self.modules.metadata())
            .with_hooks(self.modules.hooks())
            .with_journal_limit(self.journal_limit)
    }
}

fn nothing_to_recover(state: &str) -> KeystoneError {
    TransactionError::InvalidState {
        operation: "recover".to_string(),
        state: state.to_string(),
    }
    .into()
}

impl<S: StateStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store.backend_type())
            .field("classes", &self.classes)
            .field("actions", &self.actions)
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionInputs, ActionOutputs, ActionScope};
    use crate::graph::{NodeKind, NodeSpec, StaticClass};
    use crate::planner::{Diff, DiffAction};
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Action for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn filter(&self, diff: &Diff) -> bool {
            diff.action() == DiffAction::Add
        }

        async fn handle(
            &self,
            _diff: &Diff,
            _inputs: &ActionInputs,
            _scope: &mut ActionScope<'_>,
        ) -> Result<ActionOutputs> {
            Ok(ActionOutputs::new())
        }
    }

    fn engine() -> Engine<MemoryStateStore> {
        let mut classes = ClassRegistry::new();
        classes
            .register(StaticClass::model("@example", "app", "name"))
            .unwrap();
        let mut engine = Engine::new(MemoryStateStore::new(), classes);
        engine
            .actions_mut()
            .register(NodeKind::Model, Arc::new(Noop))
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_plan_then_apply() {
        let engine = engine();
        let mut models = engine.new_graph();
        models.add_node(NodeSpec::new("@example/app", "shop")).unwrap();

        let report = engine.plan(models.clone()).await.unwrap();
        assert_eq!(report.model_summary.adds, 1);
        assert!(report.resource_diffs.is_empty());
        assert!(engine.journal().await.unwrap().is_empty());
        assert!(engine.load_models().await.unwrap().is_empty());

        let record = engine.apply(models.clone()).await.unwrap();
        assert_eq!(record.status, TransactionState::Committed);
        assert!(engine.load_models().await.unwrap().contains("app=shop"));

        let report = engine.plan(models).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(report.to_string(), "No changes required\n");
    }

    #[tokio::test]
    async fn test_recover_needs_a_failed_transaction() {
        let engine = engine();
        let err = engine.recover().await.unwrap_err();
        assert!(matches!(
            err,
            KeystoneError::Transaction(TransactionError::InvalidState { ref state, .. })
                if state == "none"
        ));
    }
}
