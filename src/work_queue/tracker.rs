//! Item processing ledger: one checkpoint entry per (stage, document).
//!
//! Candidates for a stage are the documents whose input artifact exists.
//! A candidate with no ledger entry counts as PENDING. Nothing here touches
//! more than one document's entry per call, except the explicit bulk
//! operations (`backpropagate`, `requeue_failed`).

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::TrackerError;
use crate::checkpoint::CheckpointStore;
use crate::models::{ProcessingRecord, ProgressSummary, Stage, Status};
use crate::storage::ArtifactStore;

type TrackerResult<T> = Result<T, TrackerError>;

fn ledger_prefix(stage: Stage) -> String {
    format!("ledger/{}/", stage.as_str())
}

fn ledger_key(stage: Stage, document_id: &str) -> String {
    format!("{}{}", ledger_prefix(stage), document_id)
}

#[derive(Clone)]
pub struct ItemTracker {
    checkpoints: CheckpointStore,
    artifacts: ArtifactStore,
}

impl ItemTracker {
    pub fn new(checkpoints: CheckpointStore, artifacts: ArtifactStore) -> Self {
        Self {
            checkpoints,
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn record(&self, stage: Stage, document_id: &str) -> TrackerResult<Option<ProcessingRecord>> {
        Ok(self.checkpoints.load(&ledger_key(stage, document_id))?)
    }

    fn save(&self, record: &ProcessingRecord) -> TrackerResult<()> {
        self.checkpoints
            .save(&ledger_key(record.stage, &record.document_id), record)?;
        Ok(())
    }

    /// All ledger entries for a stage, by document id.
    pub fn records(&self, stage: Stage) -> TrackerResult<BTreeMap<String, ProcessingRecord>> {
        let prefix = ledger_prefix(stage);
        let mut records = BTreeMap::new();
        for key in self.checkpoints.keys(&prefix)? {
            if let Some(record) = self.checkpoints.load::<ProcessingRecord>(&key)? {
                records.insert(record.document_id.clone(), record);
            }
        }
        Ok(records)
    }

    /// Documents whose prerequisite artifact is present.
    pub fn candidates(&self, stage: Stage) -> TrackerResult<BTreeSet<String>> {
        Ok(self.artifacts.list(stage.input())?.into_keys().collect())
    }

    pub fn has_input(&self, stage: Stage, document_id: &str) -> TrackerResult<bool> {
        Ok(self.artifacts.exists(stage.input(), document_id)?)
    }

    /// Mark DONE every candidate whose output artifact already has content
    /// but whose entry says otherwise (crash between artifact write and
    /// `mark_done`). Returns the ids it marked.
    pub fn backpropagate(&self, stage: Stage) -> TrackerResult<Vec<String>> {
        let records = self.records(stage)?;
        let mut marked = Vec::new();
        for id in self.candidates(stage)? {
            if records.get(&id).is_some_and(ProcessingRecord::is_done) {
                continue;
            }
            if !self.artifacts.has_content(stage.output(), &id)? {
                continue;
            }
            let mut record = records
                .get(&id)
                .cloned()
                .unwrap_or_else(|| ProcessingRecord::pending(&id, stage));
            record.complete();
            self.save(&record)?;
            debug!("Backpropagated {} {} to done", stage, id);
            marked.push(id);
        }
        if !marked.is_empty() {
            info!("Marked {} existing {} outputs as done", marked.len(), stage);
        }
        Ok(marked)
    }

    /// Up to `limit` pending documents in ascending id order (0 = no limit).
    pub fn next_pending_batch(&self, stage: Stage, limit: usize) -> TrackerResult<Vec<String>> {
        let records = self.records(stage)?;
        let pending = self.candidates(stage)?.into_iter().filter(|id| {
            records
                .get(id)
                .map_or(true, |r| r.status == Status::Pending)
        });
        Ok(if limit == 0 {
            pending.collect()
        } else {
            pending.take(limit).collect()
        })
    }

    fn load_or_pending(&self, stage: Stage, document_id: &str) -> TrackerResult<ProcessingRecord> {
        Ok(self
            .record(stage, document_id)?
            .unwrap_or_else(|| ProcessingRecord::pending(document_id, stage)))
    }

    pub fn mark_done(&self, stage: Stage, document_id: &str) -> TrackerResult<()> {
        let mut record = self.load_or_pending(stage, document_id)?;
        record.complete();
        self.save(&record)
    }

    pub fn mark_failed(&self, stage: Stage, document_id: &str, error: &str) -> TrackerResult<()> {
        let mut record = self.load_or_pending(stage, document_id)?;
        record.fail(error);
        self.save(&record)
    }

    /// Counts over candidates plus any ledger entry whose input has since vanished.
    pub fn progress_summary(&self, stage: Stage) -> TrackerResult<ProgressSummary> {
        let records = self.records(stage)?;
        let mut ids = self.candidates(stage)?;
        ids.extend(records.keys().cloned());

        let mut summary = ProgressSummary {
            total: ids.len(),
            ..Default::default()
        };
        for id in &ids {
            match records.get(id).map(|r| r.status) {
                Some(Status::Done) => summary.done += 1,
                Some(Status::Failed) => summary.failed += 1,
                Some(Status::Pending) | None => summary.pending += 1,
            }
        }
        Ok(summary)
    }

    pub fn failed_records(&self, stage: Stage) -> TrackerResult<Vec<ProcessingRecord>> {
        Ok(self
            .records(stage)?
            .into_values()
            .filter(ProcessingRecord::is_failed)
            .collect())
    }

    pub fn select_failed(&self, stage: Stage) -> TrackerResult<Vec<String>> {
        Ok(self
            .failed_records(stage)?
            .into_iter()
            .map(|r| r.document_id)
            .collect())
    }

    /// FAILED → PENDING for every failed document. Returns the requeued ids.
    pub fn requeue_failed(&self, stage: Stage) -> TrackerResult<Vec<String>> {
        let mut requeued = Vec::new();
        for mut record in self.failed_records(stage)? {
            if record.requeue() {
                self.save(&record)?;
                requeued.push(record.document_id);
            }
        }
        Ok(requeued)
    }

    /// Requeue a single document if it is FAILED. Returns whether it changed.
    pub fn requeue(&self, stage: Stage, document_id: &str) -> TrackerResult<bool> {
        let Some(mut record) = self.record(stage, document_id)? else {
            return Ok(false);
        };
        if !record.requeue() {
            return Ok(false);
        }
        self.save(&record)?;
        Ok(true)
    }

    /// Operator-forced reset of one document to PENDING, whatever its state.
    pub fn force_reset(&self, stage: Stage, document_id: &str) -> TrackerResult<ProcessingRecord> {
        let mut record = self.load_or_pending(stage, document_id)?;
        record.force_reset();
        self.save(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtifactKind;
    use tempfile::tempdir;

    fn tracker(dir: &std::path::Path) -> ItemTracker {
        ItemTracker::new(CheckpointStore::in_memory(), ArtifactStore::new(dir))
    }

    fn add_raw(tracker: &ItemTracker, id: &str) {
        tracker
            .artifacts()
            .write(ArtifactKind::Raw, id, Some("pdf"), b"%PDF-1.4")
            .unwrap();
    }

    #[test]
    fn test_pending_batch_requires_input_and_is_ordered() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        for id in ["c", "a", "b"] {
            add_raw(&t, id);
        }
        // Text exists but no raw: not an OCR candidate
        t.artifacts()
            .write(ArtifactKind::Text, "z", None, b"orphan")
            .unwrap();

        assert_eq!(t.next_pending_batch(Stage::Ocr, 0).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(t.next_pending_batch(Stage::Ocr, 2).unwrap(), vec!["a", "b"]);
        assert_eq!(t.next_pending_batch(Stage::Correction, 0).unwrap(), vec!["z"]);
    }

    #[test]
    fn test_done_and_failed_leave_batch() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        for id in ["a", "b", "c"] {
            add_raw(&t, id);
        }
        t.mark_done(Stage::Ocr, "a").unwrap();
        t.mark_failed(Stage::Ocr, "b", "unreadable").unwrap();

        assert_eq!(t.next_pending_batch(Stage::Ocr, 0).unwrap(), vec!["c"]);
        assert_eq!(
            t.progress_summary(Stage::Ocr).unwrap(),
            ProgressSummary {
                total: 3,
                done: 1,
                failed: 1,
                pending: 1
            }
        );
        // Stages are independent
        assert!(t.record(Stage::Correction, "a").unwrap().is_none());
    }

    #[test]
    fn test_requeue_failed_increments_attempts() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        add_raw(&t, "a");
        add_raw(&t, "b");
        t.mark_failed(Stage::Ocr, "b", "boom").unwrap();
        t.mark_done(Stage::Ocr, "a").unwrap();

        assert_eq!(t.select_failed(Stage::Ocr).unwrap(), vec!["b"]);
        assert_eq!(t.requeue_failed(Stage::Ocr).unwrap(), vec!["b"]);

        let rec = t.record(Stage::Ocr, "b").unwrap().unwrap();
        assert_eq!(rec.status, Status::Pending);
        assert_eq!(rec.attempt_count, 2);
        assert!(t.select_failed(Stage::Ocr).unwrap().is_empty());
        assert!(t.record(Stage::Ocr, "a").unwrap().unwrap().is_done());
    }

    #[test]
    fn test_backpropagate_marks_existing_output() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        add_raw(&t, "a");
        add_raw(&t, "b");
        add_raw(&t, "c");
        t.artifacts().write(ArtifactKind::Text, "a", None, b"words").unwrap();
        t.artifacts().write(ArtifactKind::Text, "b", None, b"  \n").unwrap();
        t.mark_failed(Stage::Ocr, "c", "x").unwrap();
        t.artifacts().write(ArtifactKind::Text, "c", None, b"late").unwrap();

        assert_eq!(t.backpropagate(Stage::Ocr).unwrap(), vec!["a", "c"]);
        assert_eq!(t.next_pending_batch(Stage::Ocr, 0).unwrap(), vec!["b"]);
        assert!(t.backpropagate(Stage::Ocr).unwrap().is_empty());
    }

    #[test]
    fn test_force_reset_reopens_done() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        add_raw(&t, "a");
        t.mark_done(Stage::Ocr, "a").unwrap();
        assert!(t.next_pending_batch(Stage::Ocr, 0).unwrap().is_empty());

        let rec = t.force_reset(Stage::Ocr, "a").unwrap();
        assert_eq!(rec.attempt_count, 2);
        assert_eq!(t.next_pending_batch(Stage::Ocr, 0).unwrap(), vec!["a"]);
    }
}
