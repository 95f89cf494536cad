//! Task store backends.

pub mod file;
pub mod memory;

pub use file::JsonlTaskStore;
pub use memory::InMemoryTaskStore;

use std::collections::BTreeMap;

use crate::core::{StateUpdate, StoreError, TaskRow};
use crate::util::TaskId;

/// A write buffered by a session until commit.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Insert(TaskRow),
    SetState(TaskId, StateUpdate),
    MarkModified(TaskId),
    ClearModified(TaskId),
}

impl PendingWrite {
    /// Row the write touches.
    pub(crate) const fn target(&self) -> TaskId {
        match self {
            Self::Insert(row) => row.id,
            Self::SetState(id, _) | Self::MarkModified(id) | Self::ClearModified(id) => *id,
        }
    }
}

/// Apply `writes` in order. Fails without partial effects on `rows` when a
/// write targets a missing row.
pub(crate) fn apply_writes(
    rows: &mut BTreeMap<TaskId, TaskRow>,
    writes: Vec<PendingWrite>,
) -> Result<(), StoreError> {
    let mut next = rows.clone();
    for write in writes {
        match write {
            PendingWrite::Insert(row) => {
                next.insert(row.id, row);
            }
            PendingWrite::SetState(id, update) => {
                let row = next.get_mut(&id).ok_or(StoreError::RowNotFound(id))?;
                row.state = update.state;
                row.state_expires_at = update.expires_at;
                row.suspension_point = update.suspension_point;
                row.result = update.result;
            }
            PendingWrite::MarkModified(id) => {
                let row = next.get_mut(&id).ok_or(StoreError::RowNotFound(id))?;
                row.modified = true;
                row.retry = 0;
            }
            PendingWrite::ClearModified(id) => {
                let row = next.get_mut(&id).ok_or(StoreError::RowNotFound(id))?;
                row.modified = false;
            }
        }
    }
    *rows = next;
    Ok(())
}

/// Rows not yet done, failed or aborted, oldest first.
pub(crate) fn unfinished(rows: &BTreeMap<TaskId, TaskRow>) -> Vec<TaskRow> {
    let mut out: Vec<TaskRow> = rows
        .values()
        .filter(|r| !r.state.is_terminal())
        .cloned()
        .collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    out
}
