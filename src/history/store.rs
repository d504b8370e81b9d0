//! In-memory registry of history items and live evaluations.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::record::{CompletedQuery, EvalLogPaths, EvaluationRecord, HistoryItem, InitialQueryInfo, RecordState};
use super::variant_analysis::VariantAnalysisRecord;
use super::HistoryError;
use crate::server::CancellationContext;

struct Entry {
    item: HistoryItem,
    /// Present only while a local evaluation is in progress.
    cancel: Option<CancellationContext>,
}

/// Ordered collection of history items, oldest first.
///
/// Local evaluations move through `InProgress -> Completed | Failed` via
/// [`complete`](Self::complete) and [`fail`](Self::fail). Each live evaluation
/// owns a cancellation handle which is dropped as soon as it reaches a
/// terminal state, so late cancel requests are no-ops.
#[derive(Default)]
pub struct EvaluationRecordStore {
    entries: Mutex<Vec<Entry>>,
}

impl EvaluationRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with previously persisted items.
    pub fn with_items(items: Vec<HistoryItem>) -> Self {
        let store = Self::new();
        store.replace_all(items);
        store
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new in-progress evaluation and returns its cancellation handle.
    pub fn create(&self, initial: InitialQueryInfo) -> (EvaluationRecord, CancellationContext) {
        let record = EvaluationRecord::new(initial);
        let cancel = CancellationContext::new();
        self.entries().push(Entry {
            item: HistoryItem::Local(record.clone()),
            cancel: Some(cancel.clone()),
        });
        debug!(id = record.id(), "evaluation registered");
        (record, cancel)
    }

    fn with_live_record<F>(&self, id: &str, f: F) -> Result<EvaluationRecord, HistoryError>
    where
        F: FnOnce(&mut EvaluationRecord),
    {
        let mut entries = self.entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.item.id() == id)
            .ok_or_else(|| HistoryError::UnknownRecord(id.to_string()))?;
        let HistoryItem::Local(record) = &mut entry.item else {
            return Err(HistoryError::UnknownRecord(id.to_string()));
        };
        if record.state().is_terminal() {
            return Err(HistoryError::AlreadyTerminal(id.to_string()));
        }
        f(record);
        entry.cancel = None;
        Ok(record.clone())
    }

    /// Attaches the server outcome. The record ends `Completed` or `Failed`
    /// depending on whether the run succeeded.
    pub fn complete(
        &self,
        id: &str,
        completed: CompletedQuery,
        eval_log: Option<EvalLogPaths>,
    ) -> Result<EvaluationRecord, HistoryError> {
        self.with_live_record(id, |record| {
            record.completed = Some(completed);
            record.eval_log = eval_log;
        })
    }

    /// Marks an evaluation that never produced a server result.
    pub fn fail(&self, id: &str, reason: impl Into<String>) -> Result<EvaluationRecord, HistoryError> {
        let reason = reason.into();
        self.with_live_record(id, |record| record.failure_reason = Some(reason))
    }

    /// Requests cancellation. Returns false once the evaluation is terminal
    /// or unknown.
    pub fn cancel(&self, id: &str) -> bool {
        let entries = self.entries();
        match entries.iter().find(|e| e.item.id() == id).and_then(|e| e.cancel.as_ref()) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<HistoryItem> {
        self.entries().iter().find(|e| e.item.id() == id).map(|e| e.item.clone())
    }

    pub fn get_local(&self, id: &str) -> Option<EvaluationRecord> {
        match self.get(id)? {
            HistoryItem::Local(record) => Some(record),
            HistoryItem::VariantAnalysis(_) => None,
        }
    }

    /// Removes an item. Running evaluations must be cancelled first.
    pub fn remove(&self, id: &str) -> Result<HistoryItem, HistoryError> {
        let mut entries = self.entries();
        let index = entries
            .iter()
            .position(|e| e.item.id() == id)
            .ok_or_else(|| HistoryError::UnknownRecord(id.to_string()))?;
        if entries[index].cancel.is_some() {
            return Err(HistoryError::StillRunning(id.to_string()));
        }
        Ok(entries.remove(index).item)
    }

    pub fn set_label(&self, id: &str, label: Option<String>) -> Result<(), HistoryError> {
        let mut entries = self.entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.item.id() == id)
            .ok_or_else(|| HistoryError::UnknownRecord(id.to_string()))?;
        match &mut entry.item {
            HistoryItem::Local(record) => record.initial.user_specified_label = label,
            HistoryItem::VariantAnalysis(record) => record.user_specified_label = label,
        }
        Ok(())
    }

    pub fn set_result_count(&self, id: &str, count: u64) -> Result<(), HistoryError> {
        let mut entries = self.entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.item.id() == id)
            .ok_or_else(|| HistoryError::UnknownRecord(id.to_string()))?;
        match &mut entry.item {
            HistoryItem::Local(record) => match &mut record.completed {
                Some(completed) => completed.result_count = count,
                None => return Err(HistoryError::NotCompleted(id.to_string())),
            },
            HistoryItem::VariantAnalysis(record) => record.result_count = Some(count),
        }
        Ok(())
    }

    pub fn push_variant_analysis(&self, record: VariantAnalysisRecord) {
        self.entries().push(Entry {
            item: HistoryItem::VariantAnalysis(record),
            cancel: None,
        });
    }

    pub fn snapshot(&self) -> Vec<HistoryItem> {
        self.entries().iter().map(|e| e.item.clone()).collect()
    }

    /// Replaces everything not currently running with `items`.
    pub fn replace_all(&self, items: Vec<HistoryItem>) {
        let mut entries = self.entries();
        entries.retain(|e| e.cancel.is_some());
        let mut loaded: Vec<Entry> = items
            .into_iter()
            .map(|item| Entry { item, cancel: None })
            .collect();
        loaded.append(&mut entries);
        *entries = loaded;
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn count_in_state(&self, state: RecordState) -> usize {
        self.entries().iter().filter(|e| e.item.state() == state).count()
    }

    /// Drops completed local records whose artifact directory no longer
    /// exists. Records that failed before producing output are kept.
    /// Returns how many were removed.
    pub async fn remove_deleted_queries(&self) -> usize {
        let candidates: Vec<(String, PathBuf)> = self
            .entries()
            .iter()
            .filter(|e| e.cancel.is_none())
            .filter_map(|e| {
                let record = e.item.as_local()?;
                let completed = record.completed.as_ref()?;
                Some((record.id().to_string(), completed.query.query_save_dir.clone()))
            })
            .collect();

        let checks = candidates.into_iter().map(|(id, dir)| async move {
            let exists = tokio::fs::try_exists(&dir).await.unwrap_or(false);
            (id, exists)
        });
        let missing: Vec<String> = futures::future::join_all(checks)
            .await
            .into_iter()
            .filter(|(_, exists)| !exists)
            .map(|(id, _)| id)
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| e.cancel.is_some() || !missing.contains(&e.item.id()));
        let removed = before - entries.len();
        debug!(removed, "dropped history items with deleted artifacts");
        removed
    }
}
