//! Built-in actions.

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::NodeKind;
use crate::planner::{Diff, DiffAction, OWNERS_FIELD};

use super::traits::{Action, ActionInputs, ActionOutputs, ActionScope};

/// Bookkeeping for shared resource owner changes.
///
/// Owner changes have no side effects of their own; the owner set is folded
/// into the snapshot once the level completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedOwnersAction;

/// Name of [`SharedOwnersAction`].
pub const SHARED_OWNERS_ACTION: &str = "keystone/shared-owners";

#[async_trait]
impl Action for SharedOwnersAction {
    fn name(&self) -> &str {
        SHARED_OWNERS_ACTION
    }

    fn filter(&self, diff: &Diff) -> bool {
        diff.kind() == NodeKind::SharedResource
            && diff.action() == DiffAction::Update
            && diff.field() == OWNERS_FIELD
    }

    async fn handle(
        &self,
        diff: &Diff,
        _inputs: &ActionInputs,
        _scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutputs> {
        let mut outputs = ActionOutputs::new();
        outputs.insert(format!("{}.{OWNERS_FIELD}", diff.context()), diff.value().clone());
        Ok(outputs)
    }
}
