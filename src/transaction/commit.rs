//! The two-phase transaction.
//!
//! A transaction holds the app lock from [`Transaction::begin`] until it
//! commits, fails or is aborted. Each call to [`Transaction::advance`]
//! performs exactly one state transition, so callers can inspect plans or
//! stop between phases.
//!
//! Resource levels are applied with a dirty marker protocol: before a level
//! runs, every resource it touches is flagged dirty in the persisted
//! snapshot. Markers are cleared once the level's changes are folded in. A
//! failed level leaves the markers of diffs whose actions succeeded, which
//! blocks later transactions until the failure is resumed, rolled back or
//! cleared by an operator.
//!
//! The lock is checked and extended before every resource level and before
//! the snapshots are committed. A resumable failure also saves a
//! [`Checkpoint`] so another process can restore the transaction with
//! [`Transaction::restore`].

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{ActionOutputs, ActionRegistry, ActionScope, InputResolver};
use crate::error::{KeystoneError, Result, SerializationError, StateError, TransactionError};
use crate::graph::Graph;
use crate::module::ModuleMetadata;
use crate::overlay::OverlayBinder;
use crate::planner::{
    fold_into, level_diffs, Diff, DiffAction, DiffEngine, DiffMetadata, ExecutionPlan, PlannedDiff,
};
use crate::serialization::{
    ClassRegistry, Document, GraphSerializer, CHECKPOINT_DOCUMENT, MODELS_DOCUMENT,
    RESOURCES_DOCUMENT,
};
use crate::state::{LockInfo, StateStore};

use super::hooks::HookSet;
use super::journal::{self, TransactionRecord, JOURNAL_LIMIT};
use super::state::{Checkpoint, Cursor, FailurePoint, Phase, TransactionState};

/// Collaborators shared by a transaction.
pub struct TransactionContext<'e, S: StateStore + ?Sized> {
    /// Store holding snapshots, journal and the app lock.
    pub store: &'e S,
    /// Actions available to both phases.
    pub actions: &'e ActionRegistry,
    /// Metadata registered by modules.
    pub metadata: &'e ModuleMetadata,
    /// Hooks registered by modules.
    pub hooks: HookSet,
    /// Number of journal records kept.
    pub journal_limit: usize,
}

impl<'e, S: StateStore + ?Sized> TransactionContext<'e, S> {
    /// Creates a context without hooks.
    #[must_use]
    pub fn new(store: &'e S, actions: &'e ActionRegistry, metadata: &'e ModuleMetadata) -> Self {
        Self {
            store,
            actions,
            metadata,
            hooks: HookSet::default(),
            journal_limit: JOURNAL_LIMIT,
        }
    }

    /// Sets the hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sets the journal limit.
    #[must_use]
    pub const fn with_journal_limit(mut self, limit: usize) -> Self {
        self.journal_limit = limit;
        self
    }
}

impl<S: StateStore + ?Sized> std::fmt::Debug for TransactionContext<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("store", &self.store.backend_type())
            .field("actions", &self.actions)
            .field("hooks", &self.hooks)
            .field("journal_limit", &self.journal_limit)
            .finish_non_exhaustive()
    }
}

/// Snapshots loaded and planned while the lock is held.
struct Prepared {
    previous_models: Graph,
    previous_resources: Graph,
    model_plan: ExecutionPlan,
    fingerprints: BTreeMap<String, String>,
}

/// A resumable two-phase transaction.
///
/// Dropping a transaction that still holds the lock leaves the lock in
/// place until it expires.
pub struct Transaction<'e, S: StateStore + ?Sized> {
    ctx: TransactionContext<'e, S>,
    id: String,
    started_at: DateTime<Utc>,
    state: TransactionState,
    lock: Option<LockInfo>,
    models: Graph,
    previous_models: Graph,
    previous_resources: Graph,
    desired: Graph,
    actual: Graph,
    model_plan: ExecutionPlan,
    resource_plan: ExecutionPlan,
    history: Vec<DiffMetadata>,
    apply_order: u64,
    cursor: Cursor,
    failure: Option<FailurePoint>,
    fingerprints: BTreeMap<String, String>,
}

impl<S: StateStore + ?Sized> std::fmt::Debug for Transaction<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

impl<'e, S: StateStore + ?Sized> Transaction<'e, S> {
    /// Locks the app, loads the previous snapshots and plans the model
    /// phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is taken, the previous resources are
    /// dirty, a snapshot cannot be loaded, or a model diff has no action.
    /// The lock is released on every error after it was acquired.
    pub async fn begin(ctx: TransactionContext<'e, S>, mut models: Graph) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        info!("Beginning transaction {id} ({} backend)", ctx.store.backend_type());

        let lock = ctx.store.lock_app().await?;
        let prepared = match prepare(&ctx, &mut models).await {
            Ok(prepared) => prepared,
            Err(e) => {
                release(ctx.store, &lock).await;
                return Err(e);
            }
        };

        info!(
            "Transaction {id}: {} model diffs in {} levels",
            prepared.model_plan.diff_count(),
            prepared.model_plan.level_count()
        );

        Ok(Self {
            ctx,
            id,
            started_at: Utc::now(),
            state: TransactionState::Diffed,
            lock: Some(lock),
            models,
            desired: prepared.previous_resources.clone(),
            actual: prepared.previous_resources.clone(),
            previous_models: prepared.previous_models,
            previous_resources: prepared.previous_resources,
            model_plan: prepared.model_plan,
            resource_plan: ExecutionPlan::default(),
            history: Vec::new(),
            apply_order: 0,
            cursor: Cursor::default(),
            failure: None,
            fingerprints: prepared.fingerprints,
        })
    }

    /// Rebuilds a failed transaction from a checkpoint.
    ///
    /// The restored transaction holds no lock; call [`Transaction::resume`]
    /// or [`Transaction::rollback`] next.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the checkpoint is a resumable failure,
    /// `SnapshotChanged` if the persisted resources were modified since, or
    /// `ActionsChanged` if a diff now selects different actions.
    pub async fn restore(
        ctx: TransactionContext<'e, S>,
        classes: Arc<ClassRegistry>,
        checkpoint: Checkpoint,
    ) -> Result<Self> {
        match &checkpoint.failure {
            Some(failure) if checkpoint.state == TransactionState::Failed && failure.is_resumable() => {}
            _ => return Err(invalid("restore", checkpoint.state)),
        }

        let document = load_document(ctx.store, RESOURCES_DOCUMENT).await?;
        check_fingerprint(&checkpoint.fingerprints, RESOURCES_DOCUMENT, &document)?;

        let serializer = GraphSerializer::new(classes);
        let actual = serializer.deserialize(RESOURCES_DOCUMENT, &document)?;
        let models = serializer.deserialize(MODELS_DOCUMENT, &checkpoint.models)?;
        let previous_models = serializer.deserialize(MODELS_DOCUMENT, &checkpoint.previous_models)?;
        let previous_resources =
            serializer.deserialize(RESOURCES_DOCUMENT, &checkpoint.previous_resources)?;
        let desired = serializer.deserialize(RESOURCES_DOCUMENT, &checkpoint.desired_resources)?;

        let model_plan = ExecutionPlan::restore(checkpoint.model_diffs, ctx.actions)?;
        let resource_plan = ExecutionPlan::restore(checkpoint.resource_diffs, ctx.actions)?;
        let mut history: Vec<DiffMetadata> = model_plan
            .metadata()
            .chain(resource_plan.metadata())
            .filter(|m| m.applied)
            .cloned()
            .collect();
        history.sort_by_key(|m| m.apply_order);
        let apply_order = history
            .iter()
            .filter_map(|m| m.apply_order)
            .max()
            .map_or(0, |order| order + 1);

        info!(
            "Restored transaction {} at level {} diff {} ({} diffs applied)",
            checkpoint.id,
            checkpoint.cursor.level,
            checkpoint.cursor.index,
            history.len()
        );

        Ok(Self {
            ctx,
            id: checkpoint.id,
            started_at: checkpoint.started_at,
            state: checkpoint.state,
            lock: None,
            models,
            previous_models,
            previous_resources,
            desired,
            actual,
            model_plan,
            resource_plan,
            history,
            apply_order,
            cursor: checkpoint.cursor,
            failure: checkpoint.failure,
            fingerprints: checkpoint.fingerprints,
        })
    }

    /// Performs the next state transition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when no transition is possible. Any other
    /// error moves the transaction to failed and releases the lock.
    pub async fn advance(&mut self) -> Result<TransactionState> {
        let from = self.state;
        let result = match from {
            TransactionState::Diffed => self.apply_models().await,
            TransactionState::ModelActionsApplied => self.diff_resources(),
            TransactionState::ResourceDiffed => self.apply_resources().await,
            TransactionState::ResourceActionsApplied => self.commit().await,
            state => return Err(invalid("advance", state)),
        };

        match result {
            Ok(()) => {
                info!("Transaction {}: {from} -> {}", self.id, self.state);
                Ok(self.state)
            }
            Err(e) => {
                error!("Transaction {} failed while {from}: {e}", self.id);
                if self.failure.is_none() {
                    self.failure = Some(FailurePoint {
                        phase: None,
                        level: self.cursor.level,
                        index: self.cursor.index,
                        message: e.to_string(),
                    });
                }
                self.state = TransactionState::Failed;
                // Without the lock the journal and checkpoint belong to the new holder.
                if !is_lock_lost(&e) {
                    if let Err(journal_error) = self.write_journal().await {
                        warn!("Failed to record failed transaction {}: {journal_error}", self.id);
                    }
                    if self.failure.as_ref().is_some_and(FailurePoint::is_resumable)
                        && let Err(checkpoint_error) = self.save_checkpoint().await
                    {
                        warn!("Failed to save checkpoint of {}: {checkpoint_error}", self.id);
                    }
                }
                self.release_lock().await;
                Err(e)
            }
        }
    }

    /// Reacquires the lock after a resource action failure so the failed
    /// level can continue from its first unapplied diff.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a resource action failed, a lock error,
    /// or `SnapshotChanged` if the persisted resources were modified since
    /// the failure.
    pub async fn resume(&mut self) -> Result<TransactionState> {
        self.ensure_resumable("resume")?;
        self.relock().await?;

        info!(
            "Resuming transaction {} at level {} diff {}",
            self.id, self.cursor.level, self.cursor.index
        );
        self.failure = None;
        self.state = TransactionState::ResourceDiffed;
        Ok(self.state)
    }

    /// Reverts the applied diffs of the failed level and aborts.
    ///
    /// Levels folded before the failure stay in the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a resource action failed, or the first
    /// revert error. The transaction stays failed on error.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_resumable("rollback")?;
        self.relock().await?;

        if let Err(e) = self.revert_failed_level().await {
            error!("Rollback of transaction {} failed: {e}", self.id);
            self.release_lock().await;
            return Err(e);
        }

        self.failure = None;
        self.state = TransactionState::Aborted;
        self.write_journal().await?;
        self.unlock().await?;
        info!("Transaction {} rolled back", self.id);
        Ok(())
    }

    /// Stops the transaction and releases the lock without running any
    /// further action. The journal only records aborts that follow a
    /// failure or an applied resource diff.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once committed or aborted, or a lock error.
    pub async fn abort(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(invalid("abort", self.state));
        }
        info!("Aborting transaction {} while {}", self.id, self.state);
        let touched = self.state == TransactionState::Failed
            || self.resource_plan.metadata().any(|m| m.applied);
        self.state = TransactionState::Aborted;
        if touched {
            self.write_journal().await?;
        }
        self.unlock().await
    }

    /// Serializable view of the transaction.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        let serializer = GraphSerializer::new(Arc::clone(self.models.classes()));
        Checkpoint {
            id: self.id.clone(),
            started_at: self.started_at,
            state: self.state,
            cursor: self.cursor,
            failure: self.failure.clone(),
            model_diffs: self.model_plan.metadata().cloned().collect(),
            resource_diffs: self.resource_plan.metadata().cloned().collect(),
            fingerprints: self.fingerprints.clone(),
            models: serializer.serialize(&self.models),
            previous_models: serializer.serialize(&self.previous_models),
            previous_resources: serializer.serialize(&self.previous_resources),
            desired_resources: serializer.serialize(&self.desired),
        }
    }

    /// Journal record describing the transaction so far.
    #[must_use]
    pub fn record(&self) -> TransactionRecord {
        self.record_with(self.state)
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Failure details when failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailurePoint> {
        self.failure.as_ref()
    }

    /// Next resource diff to apply.
    #[must_use]
    pub const fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Lock held by the transaction.
    #[must_use]
    pub const fn lock(&self) -> Option<&LockInfo> {
        self.lock.as_ref()
    }

    /// Current model graph.
    #[must_use]
    pub const fn models(&self) -> &Graph {
        &self.models
    }

    /// Model graph from the last commit.
    #[must_use]
    pub const fn previous_models(&self) -> &Graph {
        &self.previous_models
    }

    /// Resource graph from the last commit.
    #[must_use]
    pub const fn previous_resources(&self) -> &Graph {
        &self.previous_resources
    }

    /// Desired resource graph built by model actions.
    #[must_use]
    pub const fn desired_resources(&self) -> &Graph {
        &self.desired
    }

    /// Resource snapshot including every folded level.
    #[must_use]
    pub const fn actual_resources(&self) -> &Graph {
        &self.actual
    }

    /// Model phase plan.
    #[must_use]
    pub const fn model_plan(&self) -> &ExecutionPlan {
        &self.model_plan
    }

    /// Resource phase plan, empty until resources are diffed.
    #[must_use]
    pub const fn resource_plan(&self) -> &ExecutionPlan {
        &self.resource_plan
    }

    /// Applied diffs in apply order.
    #[must_use]
    pub fn applied(&self) -> &[DiffMetadata] {
        &self.history
    }

    async fn apply_models(&mut self) -> Result<()> {
        info!(
            "Applying {} model diffs in {} levels",
            self.model_plan.diff_count(),
            self.model_plan.level_count()
        );

        let Self {
            ctx,
            models,
            previous_models,
            desired,
            actual,
            model_plan,
            history,
            apply_order,
            failure,
            ..
        } = self;

        for (level, planned_level) in model_plan.levels_mut().iter_mut().enumerate() {
            for (index, planned) in planned_level.iter_mut().enumerate() {
                let mut scope = ActionScope {
                    models: &*models,
                    previous_models: &*previous_models,
                    resources: &mut *desired,
                    actual_resources: &*actual,
                    metadata: ctx.metadata,
                };
                let result = apply_one(
                    Phase::Model,
                    &ctx.hooks,
                    planned,
                    history,
                    ctx.metadata,
                    &mut scope,
                    *apply_order,
                )
                .await;
                if planned.metadata.applied {
                    *apply_order += 1;
                    history.push(planned.metadata.clone());
                }
                if let Err(e) = result {
                    *failure = Some(FailurePoint {
                        phase: Some(Phase::Model),
                        level,
                        index,
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        self.state = TransactionState::ModelActionsApplied;
        Ok(())
    }

    fn diff_resources(&mut self) -> Result<()> {
        let bound = OverlayBinder::bind(&mut self.desired)?;
        debug!("Bound {bound} resource overlays");

        let diffs = DiffEngine::new().compute(&self.previous_resources, &self.desired)?;
        let levels = level_diffs(diffs, &self.previous_resources, &self.desired)?;
        self.resource_plan = ExecutionPlan::build(levels, self.ctx.actions)?;
        self.cursor = Cursor::default();

        info!(
            "Transaction {}: {} resource diffs in {} levels",
            self.id,
            self.resource_plan.diff_count(),
            self.resource_plan.level_count()
        );
        self.state = TransactionState::ResourceDiffed;
        Ok(())
    }

    async fn apply_resources(&mut self) -> Result<()> {
        let levels = self.resource_plan.level_count();
        while self.cursor.level < levels {
            self.apply_resource_level().await?;
            self.cursor = Cursor {
                level: self.cursor.level + 1,
                index: 0,
            };
        }
        self.state = TransactionState::ResourceActionsApplied;
        Ok(())
    }

    async fn apply_resource_level(&mut self) -> Result<()> {
        let level = self.cursor.level;
        let start = self.cursor.index;
        let pending: Vec<Diff> = self.planned_diffs(level, start).cloned().collect();
        info!("Applying resource level {level} ({} diffs)", pending.len());
        self.keep_lock().await?;

        for diff in &pending {
            self.mark_dirty(diff);
        }
        self.persist_resources().await?;

        let Self {
            ctx,
            models,
            previous_models,
            desired,
            actual,
            resource_plan,
            history,
            apply_order,
            ..
        } = self;

        let mut failed = None;
        if let Some(planned_level) = resource_plan.levels_mut().get_mut(level) {
            for (index, planned) in planned_level.iter_mut().enumerate().skip(start) {
                let mut scope = ActionScope {
                    models: &*models,
                    previous_models: &*previous_models,
                    resources: &mut *desired,
                    actual_resources: &*actual,
                    metadata: ctx.metadata,
                };
                let result = apply_one(
                    Phase::Resource,
                    &ctx.hooks,
                    planned,
                    history,
                    ctx.metadata,
                    &mut scope,
                    *apply_order,
                )
                .await;
                if planned.metadata.applied {
                    *apply_order += 1;
                    history.push(planned.metadata.clone());
                }
                if let Err(e) = result {
                    failed = Some((index, e));
                    break;
                }
            }
        }

        if let Some((index, e)) = failed {
            return Err(self.contain_failure(level, index, e).await);
        }

        let folded: Vec<Diff> = self.planned_diffs(level, 0).cloned().collect();
        for diff in &folded {
            let strategy = self.desired.classes().class(diff.class_name())?.inverse(diff);
            fold_into(&mut self.actual, &self.desired, diff, strategy)?;
        }
        for diff in &folded {
            self.actual.set_dirty(diff.context(), false);
        }
        self.persist_resources().await?;
        self.write_journal().await?;
        debug!("Resource level {level} folded");
        Ok(())
    }

    /// Folds the applied diffs of the failed level into the snapshot while
    /// keeping them dirty, clears the markers of diffs that did not apply,
    /// persists the snapshot and records where the level stopped.
    ///
    /// Applied deletes are not folded so the marker stays until the level
    /// is resumed or rolled back.
    async fn contain_failure(&mut self, level: usize, index: usize, e: KeystoneError) -> KeystoneError {
        let planned: Vec<&PlannedDiff> = self
            .resource_plan
            .levels()
            .get(level)
            .map(|l| l.iter().collect())
            .unwrap_or_default();

        let applied: Vec<String> = planned
            .iter()
            .filter(|p| p.metadata.applied)
            .map(|p| p.metadata.diff.context().to_string())
            .collect();
        let unapplied: Vec<Diff> = planned
            .iter()
            .filter(|p| !p.metadata.applied && !applied.iter().any(|c| c == p.metadata.diff.context()))
            .map(|p| p.metadata.diff.clone())
            .collect();
        let resume_at = planned
            .iter()
            .position(|p| !p.metadata.applied)
            .unwrap_or(planned.len());

        let folded: Vec<Diff> = planned
            .iter()
            .filter(|p| p.metadata.applied && p.metadata.diff.action() != DiffAction::Delete)
            .map(|p| p.metadata.diff.clone())
            .collect();
        for diff in &folded {
            if let Err(fold_error) = self.fold_dirty(diff) {
                error!("Failed to fold {diff} after failure: {fold_error}");
            }
        }
        for diff in &unapplied {
            self.unmark(diff);
        }
        warn!(
            "Resource level {level} stopped at diff {index}; {} resources left dirty",
            applied.len()
        );

        self.cursor.index = resume_at;
        self.failure = Some(FailurePoint {
            phase: Some(Phase::Resource),
            level,
            index,
            message: e.to_string(),
        });
        if let Err(persist_error) = self.persist_resources().await {
            error!("Failed to persist resources after failure: {persist_error}");
        }
        e
    }

    async fn revert_failed_level(&mut self) -> Result<()> {
        let level = self.cursor.level;
        let Self {
            models,
            previous_models,
            desired,
            actual,
            resource_plan,
            history,
            ctx,
            ..
        } = self;

        let mut reverted = Vec::new();
        if let Some(planned_level) = resource_plan.levels_mut().get_mut(level) {
            for planned in planned_level.iter_mut().rev().filter(|p| p.metadata.applied) {
                let mut scope = ActionScope {
                    models: &*models,
                    previous_models: &*previous_models,
                    resources: &mut *desired,
                    actual_resources: &*actual,
                    metadata: ctx.metadata,
                };
                let record = &planned.metadata;
                for action in planned.actions.iter().rev() {
                    info!("Reverting action {} for {}", action.name(), record.diff);
                    action
                        .revert(&record.diff, &record.inputs, &record.outputs, &mut scope)
                        .await
                        .map_err(|source| action_failed(action.name(), record, source))?;
                }
                planned.metadata.applied = false;
                planned.metadata.apply_order = None;
                history.retain(|m| m.diff != planned.metadata.diff);
                reverted.push(planned.metadata.diff.clone());
            }
        }

        for diff in &reverted {
            self.restore_previous(diff);
        }
        self.cursor.index = 0;
        self.persist_resources().await
    }

    async fn commit(&mut self) -> Result<()> {
        info!("Committing transaction {}", self.id);
        self.ctx.hooks.pre_commit(&self.models, &self.actual).await?;
        self.keep_lock().await?;

        let serializer = GraphSerializer::new(Arc::clone(self.models.classes()));
        let models = serializer.serialize(&self.models);
        self.ctx
            .store
            .save_state(MODELS_DOCUMENT, &models.to_bytes()?)
            .await?;
        self.fingerprints
            .insert(MODELS_DOCUMENT.to_string(), models.fingerprint()?);
        self.persist_resources().await?;

        for planned in self
            .model_plan
            .levels()
            .iter()
            .chain(self.resource_plan.levels())
            .flatten()
            .filter(|p| p.metadata.applied)
        {
            for action in &planned.actions {
                action.post_transaction(&planned.metadata.diff).await?;
            }
        }

        let record = self.record_with(TransactionState::Committed);
        self.ctx.hooks.post_commit(&record).await?;
        journal::record(self.ctx.store, record, self.ctx.journal_limit).await?;
        self.unlock().await?;

        self.state = TransactionState::Committed;
        info!("Transaction {} committed ({} diffs applied)", self.id, self.history.len());
        Ok(())
    }

    fn planned_diffs(&self, level: usize, start: usize) -> impl Iterator<Item = &Diff> {
        self.resource_plan
            .levels()
            .get(level)
            .and_then(|l| l.get(start..))
            .unwrap_or_default()
            .iter()
            .map(|p| &p.metadata.diff)
    }

    /// Flags the node of `diff` dirty in the snapshot, adding a
    /// placeholder for nodes that do not exist yet.
    fn mark_dirty(&mut self, diff: &Diff) {
        let context = diff.context();
        if self.actual.contains(context) {
            self.actual.set_dirty(context, true);
        } else if let Some(node) = self.desired.find(context) {
            let mut placeholder = node.clone();
            placeholder.dirty = true;
            placeholder
                .dependencies
                .retain(|d| self.actual.contains(d.to()));
            self.actual.insert_node(placeholder);
        }
    }

    /// Copies the applied change of `diff` into the snapshot, leaving the
    /// node dirty.
    fn fold_dirty(&mut self, diff: &Diff) -> Result<()> {
        let strategy = self.desired.classes().class(diff.class_name())?.inverse(diff);
        fold_into(&mut self.actual, &self.desired, diff, strategy)?;
        self.actual.set_dirty(diff.context(), true);
        Ok(())
    }

    /// Puts back the node of a reverted diff as it was at the last commit.
    fn restore_previous(&mut self, diff: &Diff) {
        match self.previous_resources.find(diff.context()) {
            Some(node) => {
                let mut node = node.clone();
                node.dirty = false;
                node.dependencies.retain(|d| self.actual.contains(d.to()));
                self.actual.insert_node(node);
            }
            None => {
                self.actual.purge(diff.context());
            }
        }
    }

    fn unmark(&mut self, diff: &Diff) {
        if diff.action() == DiffAction::Add {
            self.actual.purge(diff.context());
        } else {
            self.actual.set_dirty(diff.context(), false);
        }
    }

    async fn persist_resources(&mut self) -> Result<()> {
        let serializer = GraphSerializer::new(Arc::clone(self.actual.classes()));
        let document = serializer.serialize(&self.actual);
        self.ctx
            .store
            .save_state(RESOURCES_DOCUMENT, &document.to_bytes()?)
            .await?;
        self.fingerprints
            .insert(RESOURCES_DOCUMENT.to_string(), document.fingerprint()?);
        debug!("Persisted {} resources", document.len());
        Ok(())
    }

    /// Checks the app lock is still held by this transaction and extends
    /// it.
    async fn keep_lock(&mut self) -> Result<()> {
        let Some(lock_id) = self.lock.as_ref().map(|lock| lock.lock_id.clone()) else {
            return Err(invalid("continue without a lock", self.state));
        };

        let lost = || {
            KeystoneError::from(TransactionError::LockLost {
                lock_id: lock_id.clone(),
            })
        };
        if !self.ctx.store.is_app_locked(&lock_id).await? {
            warn!("Transaction {} no longer holds lock {lock_id}", self.id);
            self.lock = None;
            return Err(lost());
        }
        match self.ctx.store.refresh_lock(&lock_id).await {
            Ok(lock) => {
                self.lock = Some(lock);
                Ok(())
            }
            Err(KeystoneError::State(StateError::LockNotHeld { .. })) => {
                self.lock = None;
                Err(lost())
            }
            Err(e) => Err(e),
        }
    }

    async fn save_checkpoint(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.checkpoint()).map_err(|e| {
            KeystoneError::Serialization(SerializationError::json(CHECKPOINT_DOCUMENT, e))
        })?;
        self.ctx.store.save_state(CHECKPOINT_DOCUMENT, &bytes).await?;
        debug!("Saved checkpoint of transaction {}", self.id);
        Ok(())
    }

    async fn write_journal(&self) -> Result<()> {
        journal::record(self.ctx.store, self.record(), self.ctx.journal_limit).await
    }

    fn record_with(&self, status: TransactionState) -> TransactionRecord {
        let finished = matches!(
            status,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Failed
        );
        TransactionRecord {
            id: self.id.clone(),
            started_at: self.started_at,
            finished_at: finished.then(Utc::now),
            status,
            model_diffs: self.model_plan.metadata().cloned().collect(),
            applied: self.history.clone(),
            fingerprints: self.fingerprints.clone(),
            error: self.failure.as_ref().map(|f| f.message.clone()),
        }
    }

    fn ensure_resumable(&self, operation: &str) -> Result<()> {
        match &self.failure {
            Some(failure) if self.state == TransactionState::Failed && failure.is_resumable() => {
                Ok(())
            }
            _ => Err(invalid(operation, self.state)),
        }
    }

    /// Takes the lock again and checks the snapshot was not touched while
    /// the transaction was paused.
    async fn relock(&mut self) -> Result<()> {
        let lock = self.ctx.store.lock_app().await?;
        let check = self.verify_snapshot().await;
        if let Err(e) = check {
            release(self.ctx.store, &lock).await;
            return Err(e);
        }
        self.lock = Some(lock);
        Ok(())
    }

    async fn verify_snapshot(&self) -> Result<()> {
        let document = load_document(self.ctx.store, RESOURCES_DOCUMENT).await?;
        check_fingerprint(&self.fingerprints, RESOURCES_DOCUMENT, &document)
    }

    async fn unlock(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            self.ctx.store.unlock_app(&lock.lock_id).await?;
        }
        Ok(())
    }

    async fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            release(self.ctx.store, &lock).await;
        }
    }
}

async fn prepare<S: StateStore + ?Sized>(
    ctx: &TransactionContext<'_, S>,
    models: &mut Graph,
) -> Result<Prepared> {
    let serializer = GraphSerializer::new(Arc::clone(models.classes()));

    let models_document = load_document(ctx.store, MODELS_DOCUMENT).await?;
    let resources_document = load_document(ctx.store, RESOURCES_DOCUMENT).await?;

    let dirty = resources_document.dirty_contexts();
    if !dirty.is_empty() {
        warn!("Previous snapshot has {} dirty resources", dirty.len());
        return Err(TransactionError::DirtyResources { contexts: dirty }.into());
    }

    let previous_models = serializer.deserialize(MODELS_DOCUMENT, &models_document)?;
    let previous_resources = serializer.deserialize(RESOURCES_DOCUMENT, &resources_document)?;

    let mut fingerprints = BTreeMap::new();
    fingerprints.insert(MODELS_DOCUMENT.to_string(), models_document.fingerprint()?);
    fingerprints.insert(RESOURCES_DOCUMENT.to_string(), resources_document.fingerprint()?);

    let bound = OverlayBinder::bind(models)?;
    debug!("Bound {bound} model overlays");

    let diffs = DiffEngine::new().compute(&previous_models, models)?;
    let levels = level_diffs(diffs, &previous_models, models)?;
    let model_plan = ExecutionPlan::build(levels, ctx.actions)?;

    Ok(Prepared {
        previous_models,
        previous_resources,
        model_plan,
        fingerprints,
    })
}

/// Loads a document, treating a missing one as empty.
pub(crate) async fn load_document<S: StateStore + ?Sized>(store: &S, name: &str) -> Result<Document> {
    match store.get_state(name).await {
        Ok(bytes) => Document::from_bytes(name, &bytes),
        Err(KeystoneError::State(StateError::NoState { .. })) => {
            debug!("No {name} found, starting from an empty graph");
            Ok(Document::new())
        }
        Err(e) => Err(e),
    }
}

/// Fails with `SnapshotChanged` unless `document` matches the recorded
/// fingerprint of `name`.
fn check_fingerprint(
    fingerprints: &BTreeMap<String, String>,
    name: &str,
    document: &Document,
) -> Result<()> {
    let found = document.fingerprint()?;
    let expected = fingerprints.get(name).cloned().unwrap_or_default();
    if found != expected {
        return Err(TransactionError::SnapshotChanged {
            name: name.to_string(),
            expected,
            found,
        }
        .into());
    }
    Ok(())
}

/// Runs the hooks and actions of one diff, marking it applied once every
/// action succeeded.
async fn apply_one(
    phase: Phase,
    hooks: &HookSet,
    planned: &mut PlannedDiff,
    history: &[DiffMetadata],
    metadata: &ModuleMetadata,
    scope: &mut ActionScope<'_>,
    order: u64,
) -> Result<()> {
    hooks.before_action(phase, &planned.metadata).await?;
    run_actions(planned, history, metadata, scope).await?;
    planned.metadata.mark_applied(order);
    hooks.after_action(phase, &planned.metadata).await
}

async fn run_actions(
    planned: &mut PlannedDiff,
    history: &[DiffMetadata],
    metadata: &ModuleMetadata,
    scope: &mut ActionScope<'_>,
) -> Result<()> {
    let PlannedDiff {
        metadata: record,
        actions,
    } = planned;

    let mut outputs = ActionOutputs::new();
    for action in actions.iter() {
        let names = action.collect_input(&record.diff);
        let inputs = InputResolver::new(history, metadata, &*scope.resources).resolve(
            action.name(),
            &record.diff,
            &names,
            &outputs,
        )?;

        info!("Executing action {} for {}", action.name(), record.diff);
        let produced = action
            .handle(&record.diff, &inputs, scope)
            .await
            .map_err(|source| action_failed(action.name(), record, source))?;

        record.inputs.extend(inputs);
        outputs.extend(produced);
    }
    record.outputs = outputs;
    Ok(())
}

fn action_failed(action_name: &str, record: &DiffMetadata, source: KeystoneError) -> KeystoneError {
    TransactionError::ActionFailed {
        action_name: action_name.to_string(),
        context: record.diff.context().to_string(),
        action: record.diff.action().to_string(),
        field: record.diff.field().to_string(),
        level: record.level,
        source: Box::new(source),
    }
    .into()
}

const fn is_lock_lost(e: &KeystoneError) -> bool {
    matches!(e, KeystoneError::Transaction(TransactionError::LockLost { .. }))
}

fn invalid(operation: &str, state: TransactionState) -> KeystoneError {
    TransactionError::InvalidState {
        operation: operation.to_string(),
        state: state.to_string(),
    }
    .into()
}

async fn release<S: StateStore + ?Sized>(store: &S, lock: &LockInfo) {
    if let Err(e) = store.unlock_app(&lock.lock_id).await {
        warn!("Failed to release app lock {}: {e}", lock.lock_id);
    }
}
