//! File-backed task store using a JSON lines journal.
//!
//! Each committed session appends one line holding the rows it changed, in
//! their new form. Replaying the journal keeps the last version of every row.
//! A torn last line is dropped whole, so a session lands entirely or not at
//! all. The journal is compacted on open and whenever it holds more than twice
//! as many lines as rows; compaction drops finished rows that no unfinished
//! parent still needs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, create_dir_all};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::core::{NewTaskRow, StateUpdate, StoreError, StoreSession, TaskRow, TaskState, TaskStore};
use crate::infra::store::{apply_writes, unfinished, PendingWrite};
use crate::util::{Clock, SystemClock, TaskId};

/// Journal length below which no compaction happens.
pub const DEFAULT_COMPACT_MIN_LINES: usize = 1024;

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum JournalLine {
    Rows(Vec<TaskRow>),
    Header {
        #[serde(rename = "nextId")]
        next_id: TaskId,
    },
}

struct FileState {
    rows: BTreeMap<TaskId, TaskRow>,
    next_id: TaskId,
    journal_lines: usize,
}

/// Durable task store appending changed rows to a JSON lines journal.
#[derive(Clone)]
pub struct JsonlTaskStore {
    path: PathBuf,
    stream: String,
    state: Arc<Mutex<FileState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    compact_min_lines: usize,
    clock: Arc<dyn Clock>,
}

impl JsonlTaskStore {
    /// Open (or create) the store at `path/{stream}.jsonl`.
    pub fn open(path: impl AsRef<Path>, stream: impl Into<String>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, stream, Arc::new(SystemClock))
    }

    /// Like [`open`](Self::open) with an explicit clock for `created_at`.
    ///
    /// Reads and compacts the journal synchronously; call it before the
    /// scheduler starts.
    pub fn open_with_clock(
        path: impl AsRef<Path>,
        stream: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        create_dir_all(&path)?;
        let store = Self {
            path,
            stream: stream.into(),
            state: Arc::new(Mutex::new(FileState {
                rows: BTreeMap::new(),
                next_id: 1,
                journal_lines: 0,
            })),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            compact_min_lines: DEFAULT_COMPACT_MIN_LINES,
            clock,
        };
        store.load_from_disk()?;
        Ok(store)
    }

    /// Compact once the journal reaches `lines` lines (and outgrows the rows).
    #[must_use]
    pub fn with_compact_min_lines(mut self, lines: usize) -> Self {
        self.compact_min_lines = lines;
        self
    }

    /// Location of the journal.
    pub fn file_path(&self) -> PathBuf {
        self.path.join(format!("{}.jsonl", self.stream))
    }

    /// Number of rows held, finished rows not yet compacted away included.
    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// `true` when no row is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_from_disk(&self) -> Result<(), StoreError> {
        let file_path = self.file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let reader = BufReader::new(fs::File::open(&file_path)?);
        let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
        let last = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut rows = BTreeMap::new();
        let mut next_id: TaskId = 1;
        let mut journal_lines = 0;
        let mut torn = false;
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalLine>(line) {
                Ok(JournalLine::Header { next_id: id }) => next_id = next_id.max(id),
                Ok(JournalLine::Rows(batch)) => {
                    for row in batch {
                        next_id = next_id.max(row.id + 1);
                        rows.insert(row.id, row);
                    }
                }
                Err(e) if Some(i) == last => {
                    tracing::warn!(path = %file_path.display(), error = %e, "torn journal tail dropped");
                    torn = true;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            journal_lines += 1;
        }
        tracing::debug!(rows = rows.len(), journal_lines, path = %file_path.display(), "task store loaded");

        let (journal, kept) = compaction(next_id, &rows)?;
        let rewrite = torn || kept.len() != rows.len() || journal_lines != kept.len() + 1;
        {
            let mut state = self.state.lock();
            state.rows = rows;
            state.next_id = next_id;
            state.journal_lines = journal_lines;
        }
        if rewrite {
            let tmp = self.tmp_path();
            fs::write(&tmp, journal)?;
            fs::rename(&tmp, &file_path)?;
            self.install(kept);
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        self.file_path().with_extension("jsonl.tmp")
    }

    fn install(&self, kept: BTreeMap<TaskId, TaskRow>) {
        let mut state = self.state.lock();
        let dropped = state.rows.len() - kept.len();
        state.journal_lines = kept.len() + 1;
        state.rows = kept;
        tracing::debug!(rows = state.rows.len(), dropped, "task journal compacted");
    }

    async fn append(&self, line: &str) -> Result<(), StoreError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Rewrite the journal as a header plus one line per kept row.
    async fn compact(&self) -> Result<(), StoreError> {
        let (journal, kept) = {
            let state = self.state.lock();
            compaction(state.next_id, &state.rows)?
        };
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, journal).await?;
        tokio::fs::rename(&tmp, self.file_path()).await?;
        self.install(kept);
        Ok(())
    }
}

/// Unfinished rows, plus finished rows whose parent is still unfinished.
fn retained(rows: &BTreeMap<TaskId, TaskRow>) -> BTreeMap<TaskId, TaskRow> {
    rows.iter()
        .filter(|(_, row)| {
            !row.state.is_terminal()
                || row
                    .parent_id
                    .and_then(|parent| rows.get(&parent))
                    .is_some_and(|parent| !parent.state.is_terminal())
        })
        .map(|(id, row)| (*id, row.clone()))
        .collect()
}

fn encode(line: &JournalLine) -> Result<String, StoreError> {
    let mut out = serde_json::to_string(line)?;
    out.push('\n');
    Ok(out)
}

fn compaction(
    next_id: TaskId,
    rows: &BTreeMap<TaskId, TaskRow>,
) -> Result<(String, BTreeMap<TaskId, TaskRow>), StoreError> {
    let kept = retained(rows);
    let mut journal = encode(&JournalLine::Header { next_id })?;
    for row in kept.values() {
        journal.push_str(&encode(&JournalLine::Rows(vec![row.clone()]))?);
    }
    Ok((journal, kept))
}

#[async_trait]
impl TaskStore for JsonlTaskStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(FileSession {
            store: self.clone(),
            writes: Vec::new(),
        }))
    }
}

struct FileSession {
    store: JsonlTaskStore,
    writes: Vec<PendingWrite>,
}

#[async_trait]
impl StoreSession for FileSession {
    async fn load_unfinished_tasks(&mut self) -> Result<Vec<TaskRow>, StoreError> {
        Ok(unfinished(&self.store.state.lock().rows))
    }

    async fn insert_task(&mut self, row: NewTaskRow) -> Result<TaskId, StoreError> {
        let id = {
            let mut state = self.store.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            id
        };
        self.writes.push(PendingWrite::Insert(TaskRow {
            id,
            parent_id: row.parent_id,
            company_id: row.company_id,
            channel_id: row.channel_id,
            operation: row.operation,
            operation_data: row.operation_data,
            state: TaskState::Unset,
            state_expires_at: None,
            suspension_point: row.suspension_point,
            retry: row.retry,
            modified: false,
            result: None,
            created_at: self.store.clock.now(),
        }));
        Ok(id)
    }

    async fn set_task_state(&mut self, id: TaskId, update: StateUpdate) -> Result<(), StoreError> {
        self.writes.push(PendingWrite::SetState(id, update));
        Ok(())
    }

    async fn mark_modified(&mut self, id: TaskId) -> Result<(), StoreError> {
        self.writes.push(PendingWrite::MarkModified(id));
        Ok(())
    }

    async fn clear_modified(&mut self, id: TaskId) -> Result<(), StoreError> {
        self.writes.push(PendingWrite::ClearModified(id));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { store, writes } = *self;
        if writes.is_empty() {
            return Ok(());
        }
        let _writer = store.writer.lock().await;
        let changed = {
            let state = store.state.lock();
            let targets: BTreeSet<TaskId> = writes.iter().map(PendingWrite::target).collect();
            let mut touched: BTreeMap<TaskId, TaskRow> = targets
                .iter()
                .filter_map(|id| state.rows.get(id).map(|row| (*id, row.clone())))
                .collect();
            apply_writes(&mut touched, writes)?;
            touched
        };
        store
            .append(&encode(&JournalLine::Rows(changed.values().cloned().collect()))?)
            .await?;

        let compact = {
            let mut state = store.state.lock();
            state.rows.extend(changed);
            state.journal_lines += 1;
            state.journal_lines >= store.compact_min_lines && state.journal_lines > 2 * state.rows.len()
        };
        if compact {
            if let Err(e) = store.compact().await {
                tracing::warn!(path = %store.file_path().display(), error = %e, "task journal compaction failed");
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("quota-scheduler-{}", uuid::Uuid::new_v4()))
    }

    fn new_row(data: &str) -> NewTaskRow {
        NewTaskRow {
            parent_id: None,
            retry: 0,
            suspension_point: None,
            company_id: 2,
            channel_id: 1,
            operation: "foo".into(),
            operation_data: data.into(),
        }
    }

    fn child_row(parent: TaskId, data: &str) -> NewTaskRow {
        NewTaskRow {
            parent_id: Some(parent),
            ..new_row(data)
        }
    }

    fn journal(store: &JsonlTaskStore) -> Vec<String> {
        std::fs::read_to_string(store.file_path())
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_owned)
            .collect()
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = temp_dir();
        let store = JsonlTaskStore::open(&dir, "tasks").unwrap();
        let a = store.insert_task(new_row("a")).await.unwrap();
        let b = store.insert_task(new_row("b")).await.unwrap();
        store
            .set_task_state(b, StateUpdate::new(TaskState::Done).with_result(Some("ok".into())))
            .await
            .unwrap();

        let reopened = JsonlTaskStore::open(&dir, "tasks").unwrap();
        assert_eq!(reopened.len(), 1);
        let unfinished = reopened.load_unfinished_tasks().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, a);

        // b was compacted away but its id stays taken.
        let c = reopened.insert_task(new_row("c")).await.unwrap();
        assert!(c > b);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_commit_appends_one_line() {
        let dir = temp_dir();
        let store = JsonlTaskStore::open(&dir, "tasks").unwrap();
        let a = store.insert_task(new_row("a")).await.unwrap();
        assert_eq!(journal(&store).len(), 1);

        let mut session = store.begin().await.unwrap();
        session.set_task_state(a, StateUpdate::new(TaskState::Started)).await.unwrap();
        session.mark_modified(a).await.unwrap();
        let b = session.insert_task(new_row("b")).await.unwrap();
        session.commit().await.unwrap();

        let lines = journal(&store);
        assert_eq!(lines.len(), 2);
        let batch: Vec<TaskRow> = serde_json::from_str(&lines[1]).unwrap();
        let ids: Vec<TaskId> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(batch[0].state, TaskState::Started);
        assert!(batch[0].modified);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped_on_open() {
        let dir = temp_dir();
        let store = JsonlTaskStore::open(&dir, "tasks").unwrap();
        let a = store.insert_task(new_row("a")).await.unwrap();
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(store.file_path())
                .unwrap();
            file.write_all(b"[{\"id\":").unwrap();
        }

        let reopened = JsonlTaskStore::open(&dir, "tasks").unwrap();
        let rows = reopened.load_unfinished_tasks().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a);
        // Rewritten as header plus one row, so later appends start clean.
        assert_eq!(journal(&reopened).len(), 2);
        reopened.mark_modified(a).await.unwrap();
        assert!(JsonlTaskStore::open(&dir, "tasks").is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_corrupt_line_before_tail_is_an_error() {
        let dir = temp_dir();
        let store = JsonlTaskStore::open(&dir, "tasks").unwrap();
        store.insert_task(new_row("a")).await.unwrap();
        let mut contents = String::from("not json\n");
        contents.push_str(&std::fs::read_to_string(store.file_path()).unwrap());
        std::fs::write(store.file_path(), contents).unwrap();

        let err = JsonlTaskStore::open(&dir, "tasks").err().unwrap();
        assert!(matches!(err, StoreError::Serialization(_)));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_compaction_keeps_finished_children_of_live_parents() {
        let dir = temp_dir();
        let store = JsonlTaskStore::open(&dir, "tasks")
            .unwrap()
            .with_compact_min_lines(4);
        let parent = store.insert_task(new_row("p")).await.unwrap();
        let child = store.insert_task(child_row(parent, "c")).await.unwrap();
        let other = store.insert_task(new_row("x")).await.unwrap();
        store.set_task_state(other, StateUpdate::new(TaskState::Done)).await.unwrap();
        store.set_task_state(child, StateUpdate::new(TaskState::Failed)).await.unwrap();
        store.set_task_state(parent, StateUpdate::new(TaskState::Started)).await.unwrap();
        assert_eq!(journal(&store).len(), 6);

        // Seventh line outgrows twice the three rows held.
        store.set_task_state(parent, StateUpdate::new(TaskState::Suspended)).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(journal(&store).len(), 3);
        assert_eq!(store.state.lock().journal_lines, 3);

        store.set_task_state(parent, StateUpdate::new(TaskState::Done)).await.unwrap();
        let reopened = JsonlTaskStore::open(&dir, "tasks").unwrap();
        assert!(reopened.is_empty());
        assert_eq!(journal(&reopened).len(), 1);
        let other_after = reopened.insert_task(new_row("y")).await.unwrap();
        assert!(other_after > other);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_file_untouched() {
        let dir = temp_dir();
        let store = JsonlTaskStore::open(&dir, "tasks").unwrap();
        let a = store.insert_task(new_row("a")).await.unwrap();

        let mut session = store.begin().await.unwrap();
        session.mark_modified(a).await.unwrap();
        session.mark_modified(404).await.unwrap();
        assert!(session.commit().await.is_err());
        assert_eq!(journal(&store).len(), 1);

        let reopened = JsonlTaskStore::open(&dir, "tasks").unwrap();
        let rows = reopened.load_unfinished_tasks().await.unwrap();
        assert!(!rows[0].modified);
        let _ = std::fs::remove_dir_all(dir);
    }
}
