//! Stage runner: drives one `StageProcessor` over the tracker's pending work.
//!
//! Each document is processed fully and its outcome recorded before the
//! next one starts. Per-item failures are recorded and the loop continues;
//! throttling and fatal errors end the run with the current item still PENDING.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::pipeline::{ItemError, RunMode, StageEvent, StageProcessor};
use super::tracker::ItemTracker;
use super::{RunnerError, TrackerError};
use crate::models::{ProgressSummary, Stage};

/// What a stage run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageRunReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub backpropagated: usize,
    pub requeued: usize,
    /// Set when the run stopped early because of rate limiting.
    pub throttled: Option<String>,
    pub summary: ProgressSummary,
}

enum Flow {
    Continue,
    Stop,
}

pub struct StageRunner {
    tracker: ItemTracker,
    batch_size: usize,
    /// 0 means unlimited.
    limit: usize,
    item_delay: Duration,
    event_tx: Option<mpsc::Sender<StageEvent>>,
}

impl StageRunner {
    pub fn new(tracker: ItemTracker) -> Self {
        Self {
            tracker,
            batch_size: 50,
            limit: 0,
            item_delay: Duration::ZERO,
            event_tx: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<StageEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn tracker(&self) -> &ItemTracker {
        &self.tracker
    }

    async fn emit(&self, event: StageEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    fn limit_reached(&self, processed: usize) -> bool {
        self.limit > 0 && processed >= self.limit
    }

    /// Run a stage in the given mode.
    pub async fn run(
        &self,
        processor: &dyn StageProcessor,
        mode: RunMode,
    ) -> Result<StageRunReport, RunnerError> {
        let stage = processor.stage();
        let mut report = StageRunReport::default();

        match mode {
            RunMode::Progress => {}
            RunMode::Normal => {
                report.backpropagated = self.tracker.backpropagate(stage)?.len();
                let total = self.tracker.next_pending_batch(stage, 0)?.len();
                self.emit(StageEvent::StageStarted {
                    stage,
                    total_items: total,
                })
                .await;
                self.drain(processor, &mut report).await?;
            }
            RunMode::RetryFailed => {
                report.backpropagated = self.tracker.backpropagate(stage)?.len();
                let ids = self.tracker.requeue_failed(stage)?;
                report.requeued = ids.len();
                info!("Requeued {} failed {} documents", ids.len(), stage);
                self.emit(StageEvent::StageStarted {
                    stage,
                    total_items: ids.len(),
                })
                .await;
                self.process_ids(processor, &ids, &mut report).await?;
            }
        }

        report.summary = self.tracker.progress_summary(stage)?;
        if mode != RunMode::Progress {
            self.emit(StageEvent::StageCompleted {
                stage,
                succeeded: report.succeeded,
                failed: report.failed,
                remaining: report.summary.pending,
            })
            .await;
        }
        Ok(report)
    }

    /// Process one document. `force` resets a DONE (or FAILED) entry first;
    /// without it a DONE document is left alone and a FAILED one is requeued.
    pub async fn run_one(
        &self,
        processor: &dyn StageProcessor,
        document_id: &str,
        force: bool,
    ) -> Result<StageRunReport, RunnerError> {
        let stage = processor.stage();
        if !self.tracker.has_input(stage, document_id)? {
            return Err(TrackerError::MissingInput {
                stage,
                document_id: document_id.to_string(),
            }
            .into());
        }

        let mut report = StageRunReport::default();
        if force {
            self.tracker.force_reset(stage, document_id)?;
        } else if self
            .tracker
            .record(stage, document_id)?
            .is_some_and(|r| r.is_done())
        {
            info!("{} already done for {}", stage, document_id);
            report.summary = self.tracker.progress_summary(stage)?;
            return Ok(report);
        } else if self.tracker.requeue(stage, document_id)? {
            report.requeued = 1;
        }

        self.process_item(processor, document_id, &mut report).await?;
        report.summary = self.tracker.progress_summary(stage)?;
        Ok(report)
    }

    async fn drain(
        &self,
        processor: &dyn StageProcessor,
        report: &mut StageRunReport,
    ) -> Result<(), RunnerError> {
        let stage = processor.stage();
        loop {
            let batch = self.tracker.next_pending_batch(stage, self.batch_size)?;
            if batch.is_empty() {
                return Ok(());
            }
            let before = report.processed;
            if let Flow::Stop = self.process_ids(processor, &batch, report).await? {
                return Ok(());
            }
            if report.processed == before {
                return Ok(());
            }
        }
    }

    async fn process_ids(
        &self,
        processor: &dyn StageProcessor,
        ids: &[String],
        report: &mut StageRunReport,
    ) -> Result<Flow, RunnerError> {
        for id in ids {
            if self.limit_reached(report.processed) {
                return Ok(Flow::Stop);
            }
            if report.processed > 0 && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
            if let Flow::Stop = self.process_item(processor, id, report).await? {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn process_item(
        &self,
        processor: &dyn StageProcessor,
        document_id: &str,
        report: &mut StageRunReport,
    ) -> Result<Flow, RunnerError> {
        let stage: Stage = processor.stage();
        self.emit(StageEvent::ItemStarted {
            stage,
            document_id: document_id.to_string(),
        })
        .await;

        match processor.process(document_id).await {
            Ok(()) => {
                self.tracker.mark_done(stage, document_id)?;
                report.processed += 1;
                report.succeeded += 1;
                self.emit(StageEvent::ItemCompleted {
                    stage,
                    document_id: document_id.to_string(),
                })
                .await;
                Ok(Flow::Continue)
            }
            Err(ItemError::Failed(reason)) => {
                warn!("{} failed for {}: {}", stage, document_id, reason);
                self.tracker.mark_failed(stage, document_id, &reason)?;
                report.processed += 1;
                report.failed += 1;
                self.emit(StageEvent::ItemFailed {
                    stage,
                    document_id: document_id.to_string(),
                    error: reason,
                })
                .await;
                Ok(Flow::Continue)
            }
            Err(ItemError::Throttled(reason)) => {
                warn!("Stopping {} run at {}: {}", stage, document_id, reason);
                self.emit(StageEvent::Stopped {
                    stage,
                    reason: reason.clone(),
                })
                .await;
                report.throttled = Some(reason);
                Ok(Flow::Stop)
            }
            Err(ItemError::Fatal(reason)) => Err(RunnerError::Fatal {
                document_id: document_id.to_string(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::models::{ArtifactKind, Status};
    use crate::storage::ArtifactStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Writes `text/{id}.txt` unless a scripted error is set for the id.
    struct ScriptedOcr {
        store: ArtifactStore,
        errors: HashMap<String, ItemError>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StageProcessor for ScriptedOcr {
        fn stage(&self) -> Stage {
            Stage::Ocr
        }

        async fn process(&self, document_id: &str) -> Result<(), ItemError> {
            self.calls.lock().unwrap().push(document_id.to_string());
            if let Some(err) = self.errors.get(document_id) {
                return Err(err.clone());
            }
            self.store
                .write(ArtifactKind::Text, document_id, None, b"text")
                .map_err(ItemError::fatal)?;
            Ok(())
        }
    }

    fn setup(ids: &[&str], errors: Vec<(&str, ItemError)>) -> (tempfile::TempDir, ItemTracker, ScriptedOcr) {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        for id in ids {
            store.write(ArtifactKind::Raw, id, Some("pdf"), b"%PDF").unwrap();
        }
        let tracker = ItemTracker::new(CheckpointStore::in_memory(), store.clone());
        let ocr = ScriptedOcr {
            store,
            errors: errors.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            calls: Mutex::new(Vec::new()),
        };
        (dir, tracker, ocr)
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_run() {
        let (_dir, tracker, ocr) = setup(&["a", "b", "c"], vec![("b", ItemError::failed("corrupt"))]);
        let runner = StageRunner::new(tracker.clone()).with_batch_size(2);

        let report = runner.run(&ocr, RunMode::Normal).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.summary.pending, 0);
        assert_eq!(*ocr.calls.lock().unwrap(), vec!["a", "b", "c"]);

        let b = tracker.record(Stage::Ocr, "b").unwrap().unwrap();
        assert_eq!(b.last_error.as_deref(), Some("corrupt"));
    }

    #[tokio::test]
    async fn test_throttled_item_stays_pending() {
        let (_dir, tracker, ocr) = setup(&["a", "b", "c"], vec![("b", ItemError::Throttled("429".into()))]);
        let runner = StageRunner::new(tracker.clone());

        let report = runner.run(&ocr, RunMode::Normal).await.unwrap();
        assert_eq!(report.throttled.as_deref(), Some("429"));
        assert_eq!(*ocr.calls.lock().unwrap(), vec!["a", "b"]);
        assert!(tracker.record(Stage::Ocr, "b").unwrap().is_none());
        assert_eq!(tracker.next_pending_batch(Stage::Ocr, 0).unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts() {
        let (_dir, tracker, ocr) = setup(&["a", "b"], vec![("a", ItemError::fatal("disk full"))]);
        let runner = StageRunner::new(tracker);

        assert!(matches!(
            runner.run(&ocr, RunMode::Normal).await,
            Err(RunnerError::Fatal { .. })
        ));
        assert_eq!(ocr.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_limit_and_progress_mode() {
        let (_dir, tracker, ocr) = setup(&["a", "b", "c"], vec![]);
        let runner = StageRunner::new(tracker).with_limit(2);

        let report = runner.run(&ocr, RunMode::Normal).await.unwrap();
        assert_eq!(report.processed, 2);

        let progress = runner.run(&ocr, RunMode::Progress).await.unwrap();
        assert_eq!(progress.processed, 0);
        assert_eq!(progress.summary.done, 2);
        assert_eq!(progress.summary.pending, 1);
        assert_eq!(ocr.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_one_respects_done_unless_forced() {
        let (_dir, tracker, ocr) = setup(&["a"], vec![]);
        tracker.mark_done(Stage::Ocr, "a").unwrap();
        let runner = StageRunner::new(tracker.clone());

        runner.run_one(&ocr, "a", false).await.unwrap();
        assert!(ocr.calls.lock().unwrap().is_empty());

        let report = runner.run_one(&ocr, "a", true).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let rec = tracker.record(Stage::Ocr, "a").unwrap().unwrap();
        assert_eq!(rec.status, Status::Done);
        assert_eq!(rec.attempt_count, 2);

        assert!(matches!(
            runner.run_one(&ocr, "missing", false).await,
            Err(RunnerError::Tracker(TrackerError::MissingInput { .. }))
        ));
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (_dir, tracker, ocr) = setup(&["a"], vec![]);
        let (tx, mut rx) = mpsc::channel(16);
        let runner = StageRunner::new(tracker).with_events(tx);
        runner.run(&ocr, RunMode::Normal).await.unwrap();
        drop(runner);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events.first(),
            Some(&StageEvent::StageStarted {
                stage: Stage::Ocr,
                total_items: 1
            })
        );
        assert!(matches!(events.last(), Some(StageEvent::StageCompleted { succeeded: 1, .. })));
    }
}
