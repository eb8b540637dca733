//! Transaction hooks contributed by modules.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::{KeystoneError, Result, TransactionError};
use crate::graph::Graph;
use crate::planner::DiffMetadata;

use super::journal::TransactionRecord;
use super::state::Phase;

/// Callbacks around transaction stages. Every method defaults to a no-op.
///
/// An error returned by a hook fails the transaction the same way an
/// action error does.
#[async_trait]
pub trait TransactionHook: Send + Sync {
    /// Hook name used in errors and logs.
    fn name(&self) -> &str;

    /// Before the actions of a model diff run.
    async fn pre_model_action(&self, _metadata: &DiffMetadata) -> Result<()> {
        Ok(())
    }

    /// After the actions of a model diff ran.
    async fn post_model_action(&self, _metadata: &DiffMetadata) -> Result<()> {
        Ok(())
    }

    /// Before the actions of a resource diff run.
    async fn pre_resource_action(&self, _metadata: &DiffMetadata) -> Result<()> {
        Ok(())
    }

    /// After the actions of a resource diff ran.
    async fn post_resource_action(&self, _metadata: &DiffMetadata) -> Result<()> {
        Ok(())
    }

    /// Before the snapshots are persisted.
    async fn pre_commit(&self, _models: &Graph, _resources: &Graph) -> Result<()> {
        Ok(())
    }

    /// After the transaction committed.
    async fn post_commit(&self, _record: &TransactionRecord) -> Result<()> {
        Ok(())
    }
}

/// Ordered set of hooks invoked by a transaction.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn TransactionHook>>,
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name().to_string()))
            .finish()
    }
}

impl HookSet {
    /// Creates a hook set, preserving order.
    #[must_use]
    pub fn new(hooks: Vec<Arc<dyn TransactionHook>>) -> Self {
        Self { hooks }
    }

    /// Number of hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true if there are no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs the pre-action hooks of a phase.
    ///
    /// # Errors
    ///
    /// Returns `HookFailed` for the first failing hook.
    pub async fn before_action(&self, phase: Phase, metadata: &DiffMetadata) -> Result<()> {
        for hook in &self.hooks {
            let result = match phase {
                Phase::Model => hook.pre_model_action(metadata).await,
                Phase::Resource => hook.pre_resource_action(metadata).await,
            };
            result.map_err(|e| hook_failed(hook.as_ref(), &format!("pre_{phase}_action"), e))?;
        }
        Ok(())
    }

    /// Runs the post-action hooks of a phase.
    ///
    /// # Errors
    ///
    /// Returns `HookFailed` for the first failing hook.
    pub async fn after_action(&self, phase: Phase, metadata: &DiffMetadata) -> Result<()> {
        for hook in &self.hooks {
            let result = match phase {
                Phase::Model => hook.post_model_action(metadata).await,
                Phase::Resource => hook.post_resource_action(metadata).await,
            };
            result.map_err(|e| hook_failed(hook.as_ref(), &format!("post_{phase}_action"), e))?;
        }
        Ok(())
    }

    /// Runs the pre-commit hooks.
    ///
    /// # Errors
    ///
    /// Returns `HookFailed` for the first failing hook.
    pub async fn pre_commit(&self, models: &Graph, resources: &Graph) -> Result<()> {
        for hook in &self.hooks {
            hook.pre_commit(models, resources)
                .await
                .map_err(|e| hook_failed(hook.as_ref(), "pre_commit", e))?;
        }
        Ok(())
    }

    /// Runs the post-commit hooks.
    ///
    /// # Errors
    ///
    /// Returns `HookFailed` for the first failing hook.
    pub async fn post_commit(&self, record: &TransactionRecord) -> Result<()> {
        for hook in &self.hooks {
            hook.post_commit(record)
                .await
                .map_err(|e| hook_failed(hook.as_ref(), "post_commit", e))?;
        }
        Ok(())
    }
}

fn hook_failed(hook: &dyn TransactionHook, stage: &str, source: KeystoneError) -> KeystoneError {
    debug!("Hook {} failed during {stage}", hook.name());
    TransactionError::HookFailed {
        hook: hook.name().to_string(),
        stage: stage.to_string(),
        source: Box::new(source),
    }
    .into()
}
