//! Acquisition progress through the partitioned archive.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Ordered partition of the archive. Partitions are calendar years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(pub i32);

impl PartitionKey {
    pub fn year(self) -> i32 {
        self.0
    }

    pub fn successor(self) -> Self {
        PartitionKey(self.0.saturating_add(1))
    }

    /// The partition containing today's date.
    pub fn current() -> Self {
        PartitionKey(Utc::now().year())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PartitionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i32>()
            .map(PartitionKey)
            .map_err(|_| format!("invalid partition key: {:?}", s))
    }
}

/// A document listed on a search results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReference {
    /// Stable identifier, also used as the artifact file stem.
    pub id: String,
    /// Detail page URL.
    pub url: String,
    pub partition: PartitionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Persisted progress for one partition (`acquisition/partitions/{key}`).
///
/// `page_index` is the next page to fetch. `references` and `page_index`
/// are always saved together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProgress {
    pub page_index: u32,
    #[serde(default)]
    pub exhausted: bool,
    /// Exhausted because fetching failed and the run was configured to skip.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub references: BTreeSet<String>,
    /// References whose detail page reported the document unavailable.
    #[serde(default)]
    pub unavailable: BTreeSet<String>,
    /// References the sink could not store (dead links and the like), by id.
    #[serde(default)]
    pub failed: BTreeMap<String, FailedReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A reference the download sink gave up on, kept so it can be retried
/// without walking the search pages again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedReference {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub reason: String,
    /// Download attempts so far, the first included.
    #[serde(default = "first_attempt")]
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

impl FailedReference {
    pub fn new(reference: &DocumentReference, reason: impl Into<String>) -> Self {
        Self {
            url: reference.url.clone(),
            title: reference.title.clone(),
            reason: reason.into(),
            attempts: 1,
            failed_at: Utc::now(),
        }
    }

    /// Record another failed attempt.
    pub fn failed_again(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
        self.attempts += 1;
        self.failed_at = Utc::now();
    }

    /// Rebuild the reference to hand back to the sink.
    pub fn reference(&self, id: &str, partition: PartitionKey) -> DocumentReference {
        DocumentReference {
            id: id.to_string(),
            url: self.url.clone(),
            partition,
            title: self.title.clone(),
        }
    }
}

/// Pointer to the partition the cursor is working on (`acquisition/cursor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub partition: PartitionKey,
    /// Set once the configured final partition is exhausted.
    #[serde(default)]
    pub done: bool,
}

/// Where traversal stands, assembled from the cursor and partition records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionState {
    pub partition_key: PartitionKey,
    pub page_index: u32,
    /// Every reference enqueued in any partition.
    pub visited_references: BTreeSet<String>,
    pub unavailable_references: BTreeSet<String>,
    pub failed_references: BTreeSet<String>,
}

impl AcquisitionState {
    pub fn new(partition_key: PartitionKey) -> Self {
        Self {
            partition_key,
            page_index: 0,
            visited_references: BTreeSet::new(),
            unavailable_references: BTreeSet::new(),
            failed_references: BTreeSet::new(),
        }
    }

    pub fn is_visited(&self, id: &str) -> bool {
        self.visited_references.contains(id)
            || self.unavailable_references.contains(id)
            || self.failed_references.contains(id)
    }
}

/// Sidecar written next to each acquired document (`metadata/{id}.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub partition: PartitionKey,
    pub pdf_urls: Vec<String>,
    /// Label/value rows from the detail page.
    #[serde(default)]
    pub fields: std::collections::BTreeMap<String, String>,
    /// Raw artifact ids written for this document.
    pub files: Vec<String>,
    pub acquired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_parse_and_order() {
        let k: PartitionKey = "2012".parse().unwrap();
        assert_eq!(k, PartitionKey(2012));
        assert_eq!(k.successor(), PartitionKey(2013));
        assert!(PartitionKey(2012) < PartitionKey(2013));
        assert_eq!(k.to_string(), "2012");
        assert!("twenty".parse::<PartitionKey>().is_err());
    }

    #[test]
    fn test_partition_progress_tolerates_missing_fields() {
        let p: PartitionProgress = serde_json::from_str(r#"{"page_index": 4}"#).unwrap();
        assert_eq!(p.page_index, 4);
        assert!(!p.exhausted);
        assert!(p.references.is_empty());
    }

    #[test]
    fn test_failed_reference_keeps_what_a_retry_needs() {
        let reference = DocumentReference {
            id: "CIA-RDP79T00975A".into(),
            url: "https://archive.test/document/cia-rdp79t00975a".into(),
            partition: PartitionKey(1975),
            title: Some("Daily brief".into()),
        };
        let mut failed = FailedReference::new(&reference, "HTTP 404");
        failed.failed_again("HTTP 410");
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.reason, "HTTP 410");
        assert_eq!(failed.reference(&reference.id, PartitionKey(1975)), reference);

        let mut progress = PartitionProgress::default();
        progress.failed.insert(reference.id.clone(), failed);
        let json = serde_json::to_string(&progress).unwrap();
        let back: PartitionProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, progress);
    }

    #[test]
    fn test_unavailable_counts_as_visited() {
        let mut state = AcquisitionState::new(PartitionKey(2012));
        state.unavailable_references.insert("CIA-RDP1".into());
        assert!(state.is_visited("CIA-RDP1"));
        assert!(!state.is_visited("CIA-RDP2"));
    }
}
