//! Two-phase transactions over the model and resource graphs.
//!
//! Model actions turn model diffs into a desired resource graph; resource
//! actions turn resource diffs into side effects. Snapshots, dirty markers
//! and the journal are persisted through the state store.

mod commit;
mod hooks;
mod journal;
mod state;

pub(crate) use commit::load_document;
pub use commit::{Transaction, TransactionContext};
pub use hooks::{HookSet, TransactionHook};
pub use journal::{record, Journal, TransactionRecord, JOURNAL_LIMIT};
pub use state::{Checkpoint, Cursor, FailurePoint, Phase, TransactionState};
