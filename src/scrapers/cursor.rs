//! Resumable traversal of the partitioned, paginated search results.
//!
//! State machine:
//!
//! ```text
//! FetchingPage --(new refs)--> FetchingPage
//! FetchingPage --(no new refs)--> PartitionExhausted
//! PartitionExhausted --(last partition)--> Done
//! PartitionExhausted --> AdvancingPartition --> FetchingPage
//! AdvancingPartition --(no bound, next year not started)--> Idle
//! ```
//!
//! Persisted layout: `acquisition/cursor` holds the current partition,
//! `acquisition/partitions/{year}` holds that partition's page index and the
//! references taken from it. A page is committed with a single save after
//! every new reference on it has been handed to the sink.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{PageLocator, PageResult, PageSource, ReferenceSink, SinkError, SinkOutcome};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::models::{AcquisitionState, CursorRecord, FailedReference, PartitionKey, PartitionProgress};
use crate::rate_limit::{CollaboratorError, RetryGovernor, RetryOutcome};

pub const CURSOR_KEY: &str = "acquisition/cursor";
pub const PARTITION_PREFIX: &str = "acquisition/partitions/";

fn partition_checkpoint_key(partition: PartitionKey) -> String {
    format!("{}{}", PARTITION_PREFIX, partition)
}

/// Run-fatal acquisition errors. None of these leave partial state behind.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("fetching {locator} failed: {source}")]
    FetchFailed {
        locator: String,
        #[source]
        source: CollaboratorError,
    },
    #[error("rate limited at {locator} ({reason}); resume later")]
    Throttled { locator: String, reason: String },
    #[error("storing {reference} failed: {reason}")]
    Sink { reference: String, reason: String },
    #[error("{0} is not a failed reference")]
    NotFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPhase {
    FetchingPage,
    PartitionExhausted,
    AdvancingPartition,
    /// The configured last partition is exhausted.
    Done,
    /// Caught up with the present; nothing more until a new partition opens.
    Idle,
}

impl CursorPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchingPage => "fetching_page",
            Self::PartitionExhausted => "partition_exhausted",
            Self::AdvancingPartition => "advancing_partition",
            Self::Done => "done",
            Self::Idle => "idle",
        }
    }
}

/// What to do when a search page cannot be fetched after retries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PartitionErrorPolicy {
    /// Stop the run; the next run retries the same page.
    #[default]
    Abort,
    /// Record the partition as skipped and move on.
    Skip,
}

#[derive(Debug, Clone)]
pub struct CursorConfig {
    /// Partition to start from when nothing is saved.
    pub first_partition: PartitionKey,
    /// Final partition. Without one the cursor idles once it reaches the present.
    pub last_partition: Option<PartitionKey>,
    pub on_partition_error: PartitionErrorPolicy,
    /// Consecutive unavailable search pages before the partition is treated as exhausted.
    pub max_unavailable_pages: u32,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            first_partition: PartitionKey(2012),
            last_partition: None,
            on_partition_error: PartitionErrorPolicy::Abort,
            max_unavailable_pages: 3,
        }
    }
}

/// Where to start traversal.
#[derive(Debug, Clone)]
pub enum CursorStart {
    /// Continue from the saved cursor (or `first_partition`).
    Resume,
    /// Jump to a partition, resuming its saved page if any.
    Partition(PartitionKey),
    /// Start at an explicit page; its URL is fetched verbatim once.
    Locator(PageLocator),
}

#[derive(Debug, Clone)]
pub enum CursorEvent {
    PageCommitted {
        partition: PartitionKey,
        page: u32,
        new_references: usize,
    },
    PageSkipped {
        partition: PartitionKey,
        page: u32,
    },
    PartitionExhausted {
        partition: PartitionKey,
        pages: u32,
        skipped: bool,
    },
    PartitionAdvanced {
        from: PartitionKey,
        to: PartitionKey,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRunSummary {
    pub pages_fetched: u32,
    pub new_references: usize,
    pub stored: usize,
    pub already_present: usize,
    pub unavailable: usize,
    pub failed: usize,
    pub partitions_exhausted: u32,
    pub final_phase: CursorPhase,
    pub partition: PartitionKey,
    pub page_index: u32,
}

/// What a pass over previously failed references did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryFailedSummary {
    pub attempted: usize,
    pub stored: usize,
    pub unavailable: usize,
    pub still_failed: usize,
}

/// Load every partition record.
pub fn load_partitions(
    store: &CheckpointStore,
) -> Result<BTreeMap<PartitionKey, PartitionProgress>, CheckpointError> {
    let mut partitions = BTreeMap::new();
    for key in store.keys(PARTITION_PREFIX)? {
        let suffix = &key[PARTITION_PREFIX.len()..];
        let partition = suffix
            .parse::<PartitionKey>()
            .map_err(|reason| CheckpointError::Corrupt {
                key: key.clone(),
                reason,
            })?;
        if let Some(progress) = store.load::<PartitionProgress>(&key)? {
            partitions.insert(partition, progress);
        }
    }
    Ok(partitions)
}

pub fn load_cursor_record(store: &CheckpointStore) -> Result<Option<CursorRecord>, CheckpointError> {
    store.load(CURSOR_KEY)
}

/// Drives acquisition through the partitioned archive.
pub struct AcquisitionCursor {
    store: CheckpointStore,
    source: Arc<dyn PageSource>,
    sink: Arc<dyn ReferenceSink>,
    governor: RetryGovernor,
    config: CursorConfig,
    phase: CursorPhase,
    state: AcquisitionState,
    progress: PartitionProgress,
    pending_locator: Option<PageLocator>,
    unavailable_streak: u32,
    events: Option<mpsc::Sender<CursorEvent>>,
    summary: CursorRunSummary,
}

impl AcquisitionCursor {
    /// Build a cursor from persisted state, or seed it from `start`.
    pub fn open(
        store: CheckpointStore,
        source: Arc<dyn PageSource>,
        sink: Arc<dyn ReferenceSink>,
        governor: RetryGovernor,
        config: CursorConfig,
        start: CursorStart,
    ) -> Result<Self, CursorError> {
        let partitions = load_partitions(&store)?;
        let saved = load_cursor_record(&store)?;

        let mut state = AcquisitionState::new(config.first_partition);
        for progress in partitions.values() {
            state.visited_references.extend(progress.references.iter().cloned());
            state.unavailable_references.extend(progress.unavailable.iter().cloned());
            state.failed_references.extend(progress.failed.keys().cloned());
        }

        let resuming = matches!(start, CursorStart::Resume);
        let (partition, pending_locator) = match start {
            CursorStart::Resume => (
                saved.map(|c| c.partition).unwrap_or(config.first_partition),
                None,
            ),
            CursorStart::Partition(p) => (p, None),
            CursorStart::Locator(loc) => (loc.partition, Some(loc)),
        };

        let mut progress = partitions.get(&partition).cloned().unwrap_or_default();
        if let Some(loc) = &pending_locator {
            progress.page_index = loc.page;
            progress.exhausted = false;
            progress.skipped = false;
        }
        state.partition_key = partition;
        state.page_index = progress.page_index;

        let beyond_last = config.last_partition.is_some_and(|last| partition > last);
        let finished_last = resuming
            && saved.is_some_and(|c| c.done)
            && config.last_partition.is_some_and(|last| partition >= last);
        let phase = if beyond_last || finished_last {
            CursorPhase::Done
        } else if progress.exhausted {
            if config.last_partition.is_none() && partition >= PartitionKey::current() {
                // The present year keeps growing; look at its tail again.
                debug!("Reopening current partition {} at page {}", partition, progress.page_index);
                progress.exhausted = false;
                CursorPhase::FetchingPage
            } else {
                CursorPhase::PartitionExhausted
            }
        } else {
            CursorPhase::FetchingPage
        };

        if !resuming || saved.is_none() {
            store.save(
                CURSOR_KEY,
                &CursorRecord {
                    partition,
                    done: false,
                },
            )?;
        }
        if pending_locator.is_some() {
            store.save(&partition_checkpoint_key(partition), &progress)?;
        }

        info!(
            "Acquisition cursor at {} page {} ({} references known)",
            partition,
            progress.page_index,
            state.visited_references.len()
        );

        Ok(Self {
            store,
            source,
            sink,
            governor,
            config,
            phase,
            summary: CursorRunSummary {
                pages_fetched: 0,
                new_references: 0,
                stored: 0,
                already_present: 0,
                unavailable: 0,
                failed: 0,
                partitions_exhausted: 0,
                final_phase: phase,
                partition,
                page_index: progress.page_index,
            },
            state,
            progress,
            pending_locator,
            unavailable_streak: 0,
            events: None,
        })
    }

    pub fn with_events(mut self, tx: mpsc::Sender<CursorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn phase(&self) -> CursorPhase {
        self.phase
    }

    pub fn state(&self) -> &AcquisitionState {
        &self.state
    }

    pub fn progress(&self) -> &PartitionProgress {
        &self.progress
    }

    async fn emit(&self, event: CursorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Perform one transition and return the new phase.
    pub async fn step(&mut self) -> Result<CursorPhase, CursorError> {
        let next = match self.phase {
            CursorPhase::FetchingPage => self.fetch_next_page().await?,
            CursorPhase::PartitionExhausted => self.finish_partition()?,
            CursorPhase::AdvancingPartition => self.advance_partition().await?,
            terminal => terminal,
        };
        self.phase = next;
        Ok(next)
    }

    /// Step until `Done`/`Idle`, or until `max_pages` pages were fetched.
    pub async fn run(&mut self, max_pages: Option<u32>) -> Result<CursorRunSummary, CursorError> {
        while !self.phase.is_terminal() {
            if self.phase == CursorPhase::FetchingPage
                && max_pages.is_some_and(|max| self.summary.pages_fetched >= max)
            {
                info!("Page limit reached; stopping at {} page {}", self.state.partition_key, self.state.page_index);
                break;
            }
            self.step().await?;
        }

        let mut summary = self.summary.clone();
        summary.final_phase = self.phase;
        summary.partition = self.state.partition_key;
        summary.page_index = self.state.page_index;
        Ok(summary)
    }

    /// Hand references the sink failed on back to it, in every partition or
    /// just the one named by `only`. Each outcome is saved as it happens, so
    /// an interrupted pass loses nothing. The traversal position is untouched.
    pub async fn retry_failed(&mut self, only: Option<&str>) -> Result<RetryFailedSummary, CursorError> {
        let mut summary = RetryFailedSummary::default();

        for (partition, mut progress) in load_partitions(&self.store)? {
            let ids: Vec<String> = progress
                .failed
                .keys()
                .filter(|id| only.map_or(true, |wanted| wanted == id.as_str()))
                .cloned()
                .collect();

            for id in ids {
                let Some(mut failed) = progress.failed.remove(&id) else {
                    continue;
                };
                let reference = failed.reference(&id, partition);
                summary.attempted += 1;

                match self.sink.accept(&reference).await {
                    Ok(SinkOutcome::Stored { .. }) | Ok(SinkOutcome::AlreadyPresent) => {
                        info!("Recovered {} in {}", id, partition);
                        progress.references.insert(id.clone());
                        self.state.failed_references.remove(&id);
                        self.state.visited_references.insert(id.clone());
                        summary.stored += 1;
                    }
                    Ok(SinkOutcome::Unavailable) => {
                        info!("Document unavailable: {}", reference.url);
                        progress.unavailable.insert(id.clone());
                        self.state.failed_references.remove(&id);
                        self.state.unavailable_references.insert(id.clone());
                        summary.unavailable += 1;
                    }
                    Ok(SinkOutcome::Failed(reason)) => {
                        warn!("Still cannot store {}: {}", id, reason);
                        failed.failed_again(reason);
                        progress.failed.insert(id.clone(), failed);
                        summary.still_failed += 1;
                    }
                    Err(SinkError::Throttled(reason)) => {
                        return Err(CursorError::Throttled {
                            locator: reference.url,
                            reason,
                        });
                    }
                    Err(e) => {
                        return Err(CursorError::Sink {
                            reference: id,
                            reason: e.to_string(),
                        });
                    }
                }

                progress.updated_at = Some(chrono::Utc::now());
                self.store.save(&partition_checkpoint_key(partition), &progress)?;
                if partition == self.state.partition_key {
                    self.progress = progress.clone();
                }
            }
        }

        if let Some(id) = only {
            if summary.attempted == 0 {
                return Err(CursorError::NotFailed(id.to_string()));
            }
        }
        Ok(summary)
    }

    async fn fetch_next_page(&mut self) -> Result<CursorPhase, CursorError> {
        let locator = self
            .pending_locator
            .take()
            .unwrap_or_else(|| PageLocator::new(self.state.partition_key, self.state.page_index));

        let label = format!("search {}", locator);
        let source = &self.source;
        let target = &locator;
        let outcome = self
            .governor
            .execute(&label, || source.fetch_page(target))
            .await;

        let references = match outcome {
            RetryOutcome::Success { value, .. } => {
                self.summary.pages_fetched += 1;
                match value {
                    PageResult::References(refs) => refs,
                    PageResult::Unavailable => return self.skip_unavailable_page(&locator).await,
                }
            }
            RetryOutcome::Throttled { error, .. } => {
                return Err(CursorError::Throttled {
                    locator: locator.to_string(),
                    reason: error.to_string(),
                });
            }
            RetryOutcome::Exhausted { error, .. } | RetryOutcome::Fatal { error, .. } => {
                return match self.config.on_partition_error {
                    PartitionErrorPolicy::Abort => Err(CursorError::FetchFailed {
                        locator: locator.to_string(),
                        source: error,
                    }),
                    PartitionErrorPolicy::Skip => {
                        warn!("Skipping rest of partition {} after: {}", locator.partition, error);
                        self.mark_exhausted(true).await
                    }
                };
            }
        };
        self.unavailable_streak = 0;

        let mut seen = HashSet::new();
        let fresh: Vec<_> = references
            .into_iter()
            .filter(|r| !self.state.is_visited(&r.id) && seen.insert(r.id.clone()))
            .collect();

        if fresh.is_empty() {
            debug!("No new references on {}", locator);
            return self.mark_exhausted(false).await;
        }

        // Work on a copy so a failure mid-page leaves nothing half-applied.
        let mut next = self.progress.clone();
        let mut stored = 0;
        let mut already_present = 0;
        for reference in &fresh {
            match self.sink.accept(reference).await {
                Ok(SinkOutcome::Stored { .. }) => {
                    stored += 1;
                    next.references.insert(reference.id.clone());
                }
                Ok(SinkOutcome::AlreadyPresent) => {
                    already_present += 1;
                    next.references.insert(reference.id.clone());
                }
                Ok(SinkOutcome::Unavailable) => {
                    info!("Document unavailable: {}", reference.url);
                    next.unavailable.insert(reference.id.clone());
                }
                Ok(SinkOutcome::Failed(reason)) => {
                    warn!("Could not store {}: {}", reference.id, reason);
                    next.failed
                        .insert(reference.id.clone(), FailedReference::new(reference, reason));
                }
                Err(SinkError::Throttled(reason)) => {
                    return Err(CursorError::Throttled {
                        locator: locator.to_string(),
                        reason,
                    });
                }
                Err(e) => {
                    return Err(CursorError::Sink {
                        reference: reference.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        next.page_index += 1;
        next.updated_at = Some(chrono::Utc::now());
        self.store
            .save(&partition_checkpoint_key(self.state.partition_key), &next)?;

        let unavailable = next.unavailable.len() - self.progress.unavailable.len();
        let failed = next.failed.len() - self.progress.failed.len();
        self.state.visited_references.extend(next.references.iter().cloned());
        self.state.unavailable_references.extend(next.unavailable.iter().cloned());
        self.state.failed_references.extend(next.failed.keys().cloned());
        self.state.page_index = next.page_index;
        self.progress = next;

        self.summary.new_references += fresh.len();
        self.summary.stored += stored;
        self.summary.already_present += already_present;
        self.summary.unavailable += unavailable;
        self.summary.failed += failed;

        info!(
            "{}: {} new references ({} stored, {} already present)",
            locator,
            fresh.len(),
            stored,
            already_present
        );
        self.emit(CursorEvent::PageCommitted {
            partition: self.state.partition_key,
            page: locator.page,
            new_references: fresh.len(),
        })
        .await;

        Ok(CursorPhase::FetchingPage)
    }

    async fn skip_unavailable_page(&mut self, locator: &PageLocator) -> Result<CursorPhase, CursorError> {
        self.unavailable_streak += 1;
        if self.unavailable_streak >= self.config.max_unavailable_pages.max(1) {
            warn!(
                "{} consecutive unavailable pages in {}; treating partition as exhausted",
                self.unavailable_streak, locator.partition
            );
            return self.mark_exhausted(false).await;
        }

        warn!("Search page unavailable, skipping: {}", locator);
        let mut next = self.progress.clone();
        next.page_index += 1;
        next.updated_at = Some(chrono::Utc::now());
        self.store
            .save(&partition_checkpoint_key(self.state.partition_key), &next)?;
        self.state.page_index = next.page_index;
        self.progress = next;

        self.emit(CursorEvent::PageSkipped {
            partition: self.state.partition_key,
            page: locator.page,
        })
        .await;
        Ok(CursorPhase::FetchingPage)
    }

    async fn mark_exhausted(&mut self, skipped: bool) -> Result<CursorPhase, CursorError> {
        let mut next = self.progress.clone();
        next.exhausted = true;
        next.skipped = skipped;
        next.updated_at = Some(chrono::Utc::now());
        self.store
            .save(&partition_checkpoint_key(self.state.partition_key), &next)?;
        self.progress = next;
        self.summary.partitions_exhausted += 1;

        info!(
            "Partition {} exhausted at page {}",
            self.state.partition_key, self.state.page_index
        );
        self.emit(CursorEvent::PartitionExhausted {
            partition: self.state.partition_key,
            pages: self.state.page_index,
            skipped,
        })
        .await;
        Ok(CursorPhase::PartitionExhausted)
    }

    fn finish_partition(&mut self) -> Result<CursorPhase, CursorError> {
        let partition = self.state.partition_key;
        if self.config.last_partition.is_some_and(|last| partition >= last) {
            self.store.save(
                CURSOR_KEY,
                &CursorRecord {
                    partition,
                    done: true,
                },
            )?;
            info!("Final partition {} complete", partition);
            return Ok(CursorPhase::Done);
        }
        Ok(CursorPhase::AdvancingPartition)
    }

    async fn advance_partition(&mut self) -> Result<CursorPhase, CursorError> {
        let from = self.state.partition_key;
        let to = from.successor();
        if self.config.last_partition.is_none() && to > PartitionKey::current() {
            info!("Caught up through {}; waiting for new partitions", from);
            return Ok(CursorPhase::Idle);
        }

        let progress = self
            .store
            .load::<PartitionProgress>(&partition_checkpoint_key(to))?
            .unwrap_or_default();
        self.store.save(
            CURSOR_KEY,
            &CursorRecord {
                partition: to,
                done: false,
            },
        )?;

        self.state.partition_key = to;
        self.state.page_index = progress.page_index;
        let exhausted = progress.exhausted;
        self.progress = progress;
        self.unavailable_streak = 0;

        info!("Advancing from partition {} to {}", from, to);
        self.emit(CursorEvent::PartitionAdvanced { from, to }).await;

        Ok(if exhausted {
            CursorPhase::PartitionExhausted
        } else {
            CursorPhase::FetchingPage
        })
    }
}
